use num_bigint::BigInt;
use num_traits::Zero;
use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Net value movement in wei per account address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountDeltas {
    delta_by_account: HashMap<String, BigInt>,
}

/// The account whose delta has the greatest magnitude.
///
/// `account` is `None` when no account moved any value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaxDelta {
    pub account: Option<String>,
    pub delta: BigInt,
}

impl AccountDeltas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            delta_by_account: HashMap::with_capacity(capacity),
        }
    }

    /// Makes sure the account has an entry, zero if it had none.
    pub fn touch(&mut self, account: &str) -> &mut BigInt {
        self.delta_by_account
            .entry(account.to_string())
            .or_default()
    }

    pub fn credit(&mut self, account: &str, amount: &BigInt) {
        *self.touch(account) += amount;
    }

    pub fn debit(&mut self, account: &str, amount: &BigInt) {
        *self.touch(account) -= amount;
    }

    pub fn get(&self, account: &str) -> Option<&BigInt> {
        self.delta_by_account.get(account)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BigInt)> {
        self.delta_by_account.iter()
    }

    pub fn len(&self) -> usize {
        self.delta_by_account.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Folds another set of deltas into this one: union of accounts, sum per account.
    pub fn merge(&mut self, other: AccountDeltas) {
        if self.is_empty() {
            *self = other;
            return;
        }
        for (account, delta) in other.delta_by_account {
            match self.delta_by_account.entry(account) {
                Entry::Occupied(mut entry) => *entry.get_mut() += delta,
                Entry::Vacant(entry) => {
                    entry.insert(delta);
                }
            }
        }
    }

    /// Finds the account with the greatest absolute delta.
    ///
    /// Equal magnitudes resolve to the lexicographically smallest address, and
    /// zero deltas never win, so an empty table yields `MaxDelta::default()`.
    pub fn max_abs(&self) -> MaxDelta {
        let mut max: Option<(&String, &BigInt)> = None;
        for (account, delta) in self.iter() {
            if delta.is_zero() {
                continue;
            }
            let better = match max {
                None => true,
                Some((max_account, max_delta)) => {
                    delta
                        .magnitude()
                        .cmp(max_delta.magnitude())
                        .then_with(|| max_account.cmp(account))
                        == Ordering::Greater
                }
            };
            if better {
                max = Some((account, delta));
            }
        }

        max.map(|(account, delta)| MaxDelta {
            account: Some(account.clone()),
            delta: delta.clone(),
        })
        .unwrap_or_default()
    }
}

impl<S: Into<String>> FromIterator<(S, BigInt)> for AccountDeltas {
    fn from_iter<T: IntoIterator<Item = (S, BigInt)>>(iter: T) -> Self {
        let mut deltas = AccountDeltas::new();
        for (account, delta) in iter {
            deltas.credit(&account.into(), &delta);
        }
        deltas
    }
}
