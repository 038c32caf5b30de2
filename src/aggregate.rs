use crate::block::BlockHeight;
use crate::delta_utils::{extract_block_deltas, AccountDeltas, DeltaError};
use crate::rpc::{FetchError, LedgerNode};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("error getting block {height} data from eth node")]
    Fetch {
        height: BlockHeight,
        #[source]
        source: FetchError,
    },
    #[error("error computing account deltas of block {height}")]
    Extract {
        height: BlockHeight,
        #[source]
        source: DeltaError,
    },
    #[error("block worker failed")]
    Worker(#[from] JoinError),
    #[error("exited prematurely")]
    Cancelled,
}

impl AggregateError {
    /// Cancellation is a normal unwind, not a failure of any single block.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AggregateError::Cancelled)
    }
}

/// Heights `head, head - 1, ..., head - (count - 1)`, never going below genesis.
pub fn block_range(head: BlockHeight, count: u64) -> Vec<BlockHeight> {
    (0..count)
        .map_while(|offset| head.checked_sub(offset))
        .collect()
}

/// First-write-wins slot for the error that ends a run.
#[derive(Clone)]
struct ErrorSlot {
    sender: mpsc::Sender<AggregateError>,
    token: CancellationToken,
}

impl ErrorSlot {
    fn report(&self, err: AggregateError) {
        let reason = err.to_string();
        match self.sender.try_send(err) {
            Ok(()) => {
                tracing::warn!("cancelling all the work, because: {}", reason);
            }
            Err(mpsc::error::TrySendError::Full(err))
            | Err(mpsc::error::TrySendError::Closed(err)) => {
                tracing::debug!(error = %err, "dropping error reported after the first one");
            }
        }
        self.token.cancel();
    }
}

/// Fans one fetch-and-extract worker out per block height and folds their
/// results into one [`AccountDeltas`] on a single merge task.
///
/// The shared token is cancelled by the first failing worker, and may be
/// cancelled from outside (operator interrupt). Either way `run` returns no
/// deltas once it has been cancelled.
pub struct Aggregator<N> {
    node: Arc<N>,
    token: CancellationToken,
    max_in_flight: Option<usize>,
}

impl<N: LedgerNode> Aggregator<N> {
    pub fn new(node: Arc<N>, token: CancellationToken) -> Self {
        Self {
            node,
            token,
            max_in_flight: None,
        }
    }

    /// Bounds the number of concurrent block fetches. `None` means unbounded.
    pub fn with_max_in_flight(mut self, max_in_flight: Option<usize>) -> Self {
        self.max_in_flight = max_in_flight.filter(|max| *max > 0);
        self
    }

    pub async fn run(&self, heights: Vec<BlockHeight>) -> Result<AccountDeltas, AggregateError> {
        let expected = heights.len();
        let capacity = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let (result_tx, result_rx) = mpsc::channel::<AccountDeltas>(capacity);
        let (error_tx, mut error_rx) = mpsc::channel::<AggregateError>(1);
        let errors = ErrorSlot {
            sender: error_tx,
            token: self.token.clone(),
        };
        let permits = self.max_in_flight.map(|max| Arc::new(Semaphore::new(max)));

        let merge = tokio::spawn(merge_loop(result_rx, expected, self.token.clone()));

        let mut workers = JoinSet::new();
        for height in heights {
            workers.spawn(worker(
                height,
                self.node.clone(),
                self.token.clone(),
                permits.clone(),
                result_tx.clone(),
                errors.clone(),
            ));
        }
        drop(result_tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                errors.report(AggregateError::Worker(err));
            }
        }
        let merged = match merge.await {
            Ok(merged) => merged,
            Err(err) => {
                errors.report(AggregateError::Worker(err));
                None
            }
        };

        if let Ok(err) = error_rx.try_recv() {
            return Err(err);
        }
        match merged {
            Some(deltas) if !self.token.is_cancelled() => Ok(deltas),
            _ => Err(AggregateError::Cancelled),
        }
    }
}

async fn acquire(permits: Option<Arc<Semaphore>>) -> Option<OwnedSemaphorePermit> {
    match permits {
        Some(permits) => permits.acquire_owned().await.ok(),
        None => None,
    }
}

async fn worker<N: LedgerNode>(
    height: BlockHeight,
    node: Arc<N>,
    token: CancellationToken,
    permits: Option<Arc<Semaphore>>,
    results: mpsc::Sender<AccountDeltas>,
    errors: ErrorSlot,
) {
    let _permit = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        permit = acquire(permits) => permit,
    };
    if token.is_cancelled() {
        return;
    }

    tracing::debug!(height, "fetching block");
    let block = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        block = node.block_at(height) => block,
    };
    if token.is_cancelled() {
        return;
    }
    let block = match block {
        Ok(block) => block,
        Err(source) => {
            errors.report(AggregateError::Fetch { height, source });
            return;
        }
    };

    let deltas = match extract_block_deltas(&block.txs) {
        Ok(deltas) => deltas,
        Err(source) => {
            errors.report(AggregateError::Extract { height, source });
            return;
        }
    };
    tracing::debug!(
        height,
        txs = block.txs.len(),
        accounts = deltas.len(),
        "extracted block deltas"
    );

    tokio::select! {
        biased;
        _ = token.cancelled() => {}
        _ = results.send(deltas) => {}
    }
}

/// Sole owner of the cumulative table. Returns `None` if cancelled before
/// `expected` partial tables arrived.
async fn merge_loop(
    mut results: mpsc::Receiver<AccountDeltas>,
    expected: usize,
    token: CancellationToken,
) -> Option<AccountDeltas> {
    let mut total = AccountDeltas::new();
    for _ in 0..expected {
        tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            received = results.recv() => match received {
                Some(deltas) => total.merge(deltas),
                None => return None,
            },
        }
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, Transaction};
    use crate::quantity::to_hex;
    use async_trait::async_trait;
    use num_bigint::BigInt;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct MockNode {
        blocks: HashMap<BlockHeight, Block>,
        failing: HashSet<BlockHeight>,
        hanging: HashSet<BlockHeight>,
        // fetches that cancel the run themselves, then finish as usual
        cancelling: HashSet<BlockHeight>,
        // cancelled by the node on `cancelling` fetches and when a hanging fetch starts
        run_token: Option<CancellationToken>,
        fetches: AtomicUsize,
    }

    impl MockNode {
        fn with_block(mut self, height: BlockHeight, txs: Vec<Transaction>) -> Self {
            self.blocks.insert(
                height,
                Block {
                    number: to_hex(height),
                    txs,
                    ..Default::default()
                },
            );
            self
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LedgerNode for MockNode {
        async fn current_height(&self) -> Result<BlockHeight, FetchError> {
            Ok(self.blocks.keys().copied().max().unwrap_or_default())
        }

        async fn block_at(&self, height: BlockHeight) -> Result<Block, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.cancelling.contains(&height) {
                if let Some(token) = &self.run_token {
                    token.cancel();
                }
            }
            if self.hanging.contains(&height) {
                if let Some(token) = &self.run_token {
                    token.cancel();
                }
                std::future::pending::<()>().await;
            }
            if self.failing.contains(&height) {
                return Err(FetchError::Protocol {
                    method: "eth_getBlockByNumber",
                    reason: "boom".to_string(),
                });
            }
            self.blocks
                .get(&height)
                .cloned()
                .ok_or(FetchError::NotFound(height))
        }
    }

    fn tx(from: &str, to: &str, value: &str, gas: &str, gas_price: &str) -> Transaction {
        Transaction {
            from: from.to_string(),
            to: Some(to.to_string()),
            gas: gas.to_string(),
            gas_price: gas_price.to_string(),
            value: value.to_string(),
        }
    }

    fn sample_node() -> MockNode {
        MockNode::default()
            .with_block(
                10,
                vec![
                    tx("0x1", "0x3", "0x1", "0x1", "0x2"),
                    tx("0x3", "", "0x0", "0x1", "0x3"),
                ],
            )
            .with_block(9, vec![tx("0x2", "0x1", "0x64", "0x1", "0x1")])
            .with_block(8, vec![])
    }

    #[test]
    fn ranges_down_from_head() {
        assert_eq!(block_range(10, 3), vec![10, 9, 8]);
        assert_eq!(block_range(10, 0), Vec::<BlockHeight>::new());
        assert_eq!(block_range(1, 5), vec![1, 0]);
    }

    #[tokio::test]
    async fn merges_all_blocks() {
        let node = Arc::new(sample_node());
        let aggregator = Aggregator::new(node.clone(), CancellationToken::new());

        let deltas = aggregator.run(block_range(10, 3)).await.unwrap();

        assert_eq!(deltas.get("0x1"), Some(&BigInt::from(-3 + 100)));
        assert_eq!(deltas.get("0x2"), Some(&BigInt::from(-101)));
        assert_eq!(deltas.get("0x3"), Some(&BigInt::from(-2)));
        assert_eq!(deltas.len(), 3);
        assert_eq!(node.fetches(), 3);

        let max = deltas.max_abs();
        assert_eq!(max.account.as_deref(), Some("0x2"));
    }

    #[tokio::test]
    async fn bounded_fan_out_gives_same_result() {
        let unbounded = Aggregator::new(Arc::new(sample_node()), CancellationToken::new())
            .run(block_range(10, 3))
            .await
            .unwrap();
        let bounded = Aggregator::new(Arc::new(sample_node()), CancellationToken::new())
            .with_max_in_flight(Some(1))
            .run(block_range(10, 3))
            .await
            .unwrap();

        assert_eq!(unbounded, bounded);
    }

    #[tokio::test]
    async fn no_heights_is_empty_result() {
        let aggregator = Aggregator::new(Arc::new(MockNode::default()), CancellationToken::new());

        let deltas = aggregator.run(vec![]).await.unwrap();
        assert!(deltas.is_empty());
        assert_eq!(deltas.max_abs().account, None);
    }

    #[tokio::test]
    async fn malformed_quantity_fails_run() {
        let node = sample_node().with_block(7, vec![tx("0x1", "0x2", "0x1", "oops", "0x1")]);
        let token = CancellationToken::new();
        let aggregator = Aggregator::new(Arc::new(node), token.clone());

        let err = aggregator.run(block_range(10, 4)).await.unwrap_err();

        assert!(
            matches!(
                err,
                AggregateError::Extract {
                    height: 7,
                    source: DeltaError::MalformedQuantity { field: "gas", .. }
                }
            ),
            "{:?}",
            err
        );
        assert!(!err.is_cancelled());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn fetch_failure_fails_run() {
        let mut node = sample_node();
        node.failing.insert(9);
        let aggregator = Aggregator::new(Arc::new(node), CancellationToken::new());

        let err = aggregator.run(block_range(10, 3)).await.unwrap_err();
        assert!(
            matches!(err, AggregateError::Fetch { height: 9, .. }),
            "{:?}",
            err
        );
    }

    #[tokio::test]
    async fn surfaces_exactly_one_of_many_errors() {
        let mut node = MockNode::default();
        node.failing.extend(0..50);
        let aggregator = Aggregator::new(Arc::new(node), CancellationToken::new());

        let err = aggregator.run(block_range(49, 50)).await.unwrap_err();
        assert!(matches!(err, AggregateError::Fetch { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn failure_stops_blocked_workers() {
        let mut node = sample_node();
        node.hanging.insert(8);
        node.failing.insert(9);
        let aggregator = Aggregator::new(Arc::new(node), CancellationToken::new());

        let run = aggregator.run(block_range(10, 3));
        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("hanging fetch was not abandoned");
        assert!(matches!(result, Err(AggregateError::Fetch { height: 9, .. })));
    }

    #[tokio::test]
    async fn interrupt_stops_run_without_result() {
        let token = CancellationToken::new();
        let mut node = sample_node();
        node.hanging.insert(9);
        let node = Arc::new(node);
        let aggregator = Aggregator::new(node.clone(), token.clone());

        let run = tokio::spawn(async move { aggregator.run(block_range(10, 3)).await });
        while node.fetches() < 3 {
            tokio::task::yield_now().await;
        }
        token.cancel();

        let err = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run did not stop after interrupt")
            .unwrap()
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "exited prematurely");
    }

    #[tokio::test]
    async fn cancelled_workers_make_no_further_fetches() {
        let token = CancellationToken::new();
        let mut node = MockNode {
            run_token: Some(token.clone()),
            ..Default::default()
        };
        for height in 0..20 {
            node = node.with_block(height, vec![]);
            node.hanging.insert(height);
        }
        let node = Arc::new(node);
        let aggregator = Aggregator::new(node.clone(), token).with_max_in_flight(Some(1));

        let err = aggregator.run(block_range(19, 20)).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(node.fetches(), 1);
    }

    #[tokio::test]
    async fn interrupt_during_fetch_wins_over_malformed_block() {
        let token = CancellationToken::new();
        let mut node = MockNode {
            run_token: Some(token.clone()),
            ..Default::default()
        }
        .with_block(3, vec![tx("0x1", "0x2", "0x1", "oops", "0x1")]);
        node.cancelling.insert(3);
        let aggregator = Aggregator::new(Arc::new(node), token);

        let err = aggregator.run(vec![3]).await.unwrap_err();
        assert!(err.is_cancelled(), "{:?}", err);
    }

    #[tokio::test]
    async fn already_cancelled_run_fetches_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let node = Arc::new(sample_node());
        let aggregator = Aggregator::new(node.clone(), token);

        let err = aggregator.run(block_range(10, 3)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(node.fetches(), 0);
    }
}
