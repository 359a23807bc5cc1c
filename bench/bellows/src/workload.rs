use crate::config;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// One synthesized operation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OpChoice {
    Set { key: Vec<u8>, value: Vec<u8> },
    Get { keys: Vec<Vec<u8>> },
}

/// Per-connection operation synthesizer. Keys cycle through a fixed window;
/// values are a deterministic fill so a reader can spot corruption in
/// captures.
pub struct Workload {
    rng: StdRng,
    set_ratio: f64,
    window_size: u64,
    value_size: usize,
    mget_batch: usize,
}

impl Workload {
    pub fn new(settings: &config::Workload, seed: u64) -> Workload {
        Workload {
            rng: StdRng::seed_from_u64(seed),
            set_ratio: settings.set_ratio,
            window_size: settings.window_size.max(1),
            value_size: settings.value_size,
            mget_batch: settings.mget_batch.max(1),
        }
    }

    pub fn next_op(&mut self) -> OpChoice {
        if self.rng.gen::<f64>() < self.set_ratio {
            let index = self.rng.gen_range(0..self.window_size);
            OpChoice::Set {
                key: key_for(index),
                value: value_for(index, self.value_size),
            }
        } else {
            let keys = (0..self.mget_batch)
                .map(|_| key_for(self.rng.gen_range(0..self.window_size)))
                .collect();
            OpChoice::Get { keys }
        }
    }
}

fn key_for(index: u64) -> Vec<u8> {
    format!("bellows_{:010}", index).into_bytes()
}

fn value_for(index: u64, size: usize) -> Vec<u8> {
    let pattern = format!("{:08x}", index);
    pattern.as_bytes().iter().copied().cycle().take(size).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(set_ratio: f64, batch: usize) -> config::Workload {
        config::Workload {
            set_ratio,
            window_size: 100,
            value_size: 32,
            mget_batch: batch,
        }
    }

    #[test]
    fn test_same_seed_same_stream() {
        let mut first = Workload::new(&settings(0.5, 1), 42);
        let mut second = Workload::new(&settings(0.5, 1), 42);

        for _ in 0..50 {
            assert_eq!(first.next_op(), second.next_op());
        }
    }

    #[test]
    fn test_ratio_extremes() {
        let mut all_sets = Workload::new(&settings(1.0, 1), 7);
        let mut all_gets = Workload::new(&settings(0.0, 1), 7);

        for _ in 0..20 {
            match all_sets.next_op() {
                OpChoice::Set { key, value } => {
                    assert!(key.starts_with(b"bellows_"));
                    assert_eq!(value.len(), 32);
                }
                op => panic!("Unexpected op {:?}", op),
            }
            match all_gets.next_op() {
                OpChoice::Get { keys } => assert_eq!(keys.len(), 1),
                op => panic!("Unexpected op {:?}", op),
            }
        }
    }

    #[test]
    fn test_mget_batch_size() {
        let mut workload = Workload::new(&settings(0.0, 5), 11);

        match workload.next_op() {
            OpChoice::Get { keys } => assert_eq!(keys.len(), 5),
            op => panic!("Unexpected op {:?}", op),
        }
    }

    #[test]
    fn test_keys_stay_in_window() {
        let mut workload = Workload::new(&settings(1.0, 1), 3);

        for _ in 0..200 {
            if let OpChoice::Set { key, .. } = workload.next_op() {
                let text = String::from_utf8(key).unwrap();
                let index: u64 = text["bellows_".len()..].parse().unwrap();
                assert!(index < 100);
            }
        }
    }
}
