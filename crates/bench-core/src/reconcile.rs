use crate::sink::CorrelationId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// First position where the sorted sent and received sets disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub index: usize,
    pub sent: Option<CorrelationId>,
    pub received: Option<CorrelationId>,
}

/// Comparison of submitted correlation ids against completed ones.
///
/// Both sides are treated as multisets: order of arrival is irrelevant, but
/// an id received twice counts once as matched and once as unexpected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub sent: usize,
    pub received: usize,
    /// Sent but never completed
    pub missing: usize,
    /// Completed but never sent, or completed more often than sent
    pub unexpected: usize,
    pub first_mismatch: Option<Mismatch>,
    pub matched: bool,
}

impl Reconciliation {
    pub fn compute(mut sent: Vec<CorrelationId>, mut received: Vec<CorrelationId>) -> Self {
        sent.sort_unstable();
        received.sort_unstable();

        let first_mismatch = (0..sent.len().max(received.len()))
            .find(|&i| sent.get(i) != received.get(i))
            .map(|index| Mismatch {
                index,
                sent: sent.get(index).copied(),
                received: received.get(index).copied(),
            });

        let (mut missing, mut unexpected) = (0usize, 0usize);
        let (mut i, mut j) = (0usize, 0usize);
        while i < sent.len() && j < received.len() {
            match sent[i].cmp(&received[j]) {
                Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
                Ordering::Less => {
                    missing += 1;
                    i += 1;
                }
                Ordering::Greater => {
                    unexpected += 1;
                    j += 1;
                }
            }
        }
        missing += sent.len() - i;
        unexpected += received.len() - j;

        Self {
            sent: sent.len(),
            received: received.len(),
            missing,
            unexpected,
            first_mismatch,
            matched: first_mismatch.is_none(),
        }
    }

    /// Share of sent jobs that never completed, in percent.
    pub fn lost_rate(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        self.missing as f64 * 100.0 / self.sent as f64
    }
}

impl fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.matched {
            return write!(f, "OK: {} sent, {} received", self.sent, self.received);
        }

        if self.sent != self.received {
            write!(
                f,
                "MISMATCH: count differs (sent={}, received={})",
                self.sent, self.received
            )?;
        } else {
            write!(f, "MISMATCH: {} sent and received", self.sent)?;
        }
        write!(f, ", missing={}, unexpected={}", self.missing, self.unexpected)?;

        if let Some(m) = self.first_mismatch {
            let show = |v: Option<CorrelationId>| match v {
                Some(v) => v.to_string(),
                None => "-".to_string(),
            };
            write!(
                f,
                ", first difference at #{}: sent={} received={}",
                m.index,
                show(m.sent),
                show(m.received)
            )?;
        }
        Ok(())
    }
}
