//! At-least-once delivery simulation

use rand::seq::SliceRandom;
use rand::Rng;
use stagegate::{CoordinationError, CoordinationResult};

/// One simulated bus delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub worker: String,
    pub item_count: u64,
}

/// Every worker delivered once or more, in random order.
#[derive(Debug, Clone)]
pub struct DeliveryPlan {
    pub deliveries: Vec<Delivery>,
    /// Item count of each worker, in worker order
    pub first_counts: Vec<u64>,
}

impl DeliveryPlan {
    /// `workers` distinct workers, each delivered between 1 and
    /// `max_copies` times with an identical payload.
    pub fn shuffled(workers: usize, max_copies: usize) -> Self {
        let mut rng = rand::thread_rng();
        let mut first_counts = Vec::with_capacity(workers);
        let mut deliveries = Vec::new();
        for i in 0..workers {
            let count = rng.gen_range(1..=40);
            first_counts.push(count);
            deliveries.push(Delivery {
                worker: format!("w-{}", i),
                item_count: count,
            });
        }
        deliveries.shuffle(&mut rng);

        // Redeliveries arrive after the original, anywhere later in the stream.
        for i in 0..workers {
            for _ in 1..rng.gen_range(1..=max_copies.max(1)) {
                let original = deliveries
                    .iter()
                    .position(|d| d.worker == format!("w-{}", i))
                    .unwrap();
                let at = rng.gen_range(original + 1..=deliveries.len());
                deliveries.insert(
                    at,
                    Delivery {
                        worker: format!("w-{}", i),
                        item_count: first_counts[i],
                    },
                );
            }
        }
        Self {
            deliveries,
            first_counts,
        }
    }

    /// Split into `n` interleaved slices for concurrent callers.
    pub fn split(&self, n: usize) -> Vec<Vec<Delivery>> {
        let mut parts = vec![Vec::new(); n];
        for (i, d) in self.deliveries.iter().enumerate() {
            parts[i % n].push(d.clone());
        }
        parts
    }
}

/// Call `f` until it stops failing with a retryable error, the way a bus
/// redelivers a message whose handler returned "unknown".
pub fn deliver_with_redelivery<T, F>(mut f: F) -> CoordinationResult<T>
where
    F: FnMut() -> CoordinationResult<T>,
{
    for _ in 0..100 {
        match f() {
            Err(e) if e.is_retryable() => continue,
            other => return other,
        }
    }
    Err(CoordinationError::Upstream("redelivery budget exhausted".to_string()))
}
