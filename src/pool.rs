use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Bounded history of generated fakes shown to the discriminator.
///
/// Once full, each queried sample has an even chance of being swapped with a
/// uniformly chosen stored sample, which is then returned in its place. The pool
/// lives on a single device and has a single writer, hence `query(&mut self)`.
#[derive(Debug)]
pub struct FakePool<B: Backend> {
    capacity: usize,
    entries: Vec<Tensor<B, 4>>,
    rng: StdRng,
}

impl<B: Backend> FakePool<B> {
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self::with_rng(capacity, StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(capacity: usize, rng: StdRng) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity),
            rng,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stored samples in slot order, each shaped `[1, C, H, W]`.
    pub fn entries(&self) -> &[Tensor<B, 4>] {
        &self.entries
    }

    /// Return a batch of the same size where some samples may be replaced by history.
    pub fn query(&mut self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let batch = images.dims()[0];
        if self.capacity == 0 || batch == 0 {
            return images;
        }

        let mut selected = Vec::with_capacity(batch);
        for idx in 0..batch {
            let image = images.clone().slice_dim(0, idx..idx + 1).detach();
            if self.entries.len() < self.capacity {
                self.entries.push(image.clone());
                selected.push(image);
            } else if self.rng.gen_bool(0.5) {
                let slot = self.rng.gen_range(0..self.capacity);
                let previous = std::mem::replace(&mut self.entries[slot], image);
                selected.push(previous);
            } else {
                selected.push(image);
            }
        }

        Tensor::cat(selected, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn samples(values: &[f32]) -> Tensor<TestBackend, 4> {
        let device = Default::default();
        Tensor::<TestBackend, 4>::from_data(
            TensorData::new(values.to_vec(), [values.len(), 1, 1, 1]),
            &device,
        )
    }

    fn values(tensor: Tensor<TestBackend, 4>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    fn pool_values(pool: &FakePool<TestBackend>) -> Vec<f32> {
        pool.entries()
            .iter()
            .flat_map(|entry| values(entry.clone()))
            .collect()
    }

    #[test]
    fn zero_capacity_passes_batch_through() {
        let mut pool = FakePool::<TestBackend>::new(0, 7);
        for batch in [vec![1.0], vec![1.0, 2.0, 3.0], vec![-4.0; 5]] {
            let out = pool.query(samples(&batch));
            assert_eq!(values(out), batch);
            assert!(pool.is_empty());
        }
    }

    #[test]
    fn fills_in_insertion_order_before_swapping() {
        let mut pool = FakePool::<TestBackend>::new(3, 11);
        for value in [1.0, 2.0, 3.0] {
            let out = pool.query(samples(&[value]));
            assert_eq!(values(out), vec![value]);
        }
        assert_eq!(pool.len(), 3);
        assert_eq!(pool_values(&pool), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn batch_is_split_per_sample_and_keeps_order() {
        let mut pool = FakePool::<TestBackend>::new(2, 3);
        let out = pool.query(samples(&[10.0, 20.0, 30.0, 40.0]));
        let out = values(out);

        assert_eq!(out.len(), 4);
        assert_eq!(&out[..2], &[10.0, 20.0]);
        for (position, value) in out.iter().enumerate().skip(2) {
            let fresh = [30.0, 40.0][position - 2];
            assert!(
                *value == fresh || [10.0, 20.0, 30.0].contains(value),
                "unexpected sample {value} at {position}"
            );
        }
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn full_pool_returns_fresh_or_swapped_history() {
        let capacity = 4;
        let mut pool = FakePool::<TestBackend>::new(capacity, 42);
        let mut shadow = Vec::new();
        for value in 0..capacity {
            let value = value as f32;
            pool.query(samples(&[value]));
            shadow.push(value);
        }

        let mut swapped = 0;
        let mut passed = 0;
        for step in 0..100 {
            let fresh = 100.0 + step as f32;
            let out = values(pool.query(samples(&[fresh])));
            assert_eq!(out.len(), 1);
            let returned = out[0];

            if returned == fresh {
                passed += 1;
            } else {
                let slot = shadow
                    .iter()
                    .position(|stored| *stored == returned)
                    .expect("returned a sample that was never stored");
                shadow[slot] = fresh;
                swapped += 1;
            }
            assert_eq!(pool_values(&pool), shadow);
        }

        assert!(swapped > 0);
        assert!(passed > 0);
        assert_eq!(pool.len(), capacity);
    }

    #[test]
    fn same_seed_gives_same_history() {
        let run = |seed| {
            let mut pool = FakePool::<TestBackend>::new(2, seed);
            (0..20)
                .flat_map(|step| values(pool.query(samples(&[step as f32]))))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(5), run(5));
    }
}
