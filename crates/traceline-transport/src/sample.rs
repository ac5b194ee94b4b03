// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use rand::Rng;

/// Uniform reservoir sample of fixed size. Every pushed value has an equal
/// chance of ending up in the reservoir regardless of how many were seen.
#[derive(Debug)]
pub struct UniformSample<T> {
    size: usize,
    count: u64,
    values: Vec<T>,
}

impl<T> UniformSample<T> {
    pub fn new(size: usize) -> UniformSample<T> {
        UniformSample {
            size,
            count: 0,
            values: Vec::with_capacity(size),
        }
    }

    /// Values seen, including those the reservoir rejected.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.values.iter()
    }

    pub fn clear(&mut self) {
        self.count = 0;
        self.values.clear();
    }

    pub fn push(&mut self, value: T) {
        self.count += 1;
        if self.values.len() < self.size {
            self.values.push(value);
            return;
        }

        let slot = rand::rng().random_range(0..self.count);
        if (slot as usize) < self.size {
            self.values[slot as usize] = value;
        }
    }
}

impl<T> IntoIterator for UniformSample<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fills_up_to_size() {
        let mut sample = UniformSample::new(3);
        for i in 0..3 {
            sample.push(i);
        }
        assert_eq!(sample.len(), 3);
        assert_eq!(sample.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn caps_at_size_but_counts_everything() {
        let mut sample = UniformSample::new(4);
        for i in 0..100 {
            sample.push(i);
        }
        assert_eq!(sample.len(), 4);
        assert_eq!(sample.count(), 100);
    }

    #[test]
    fn clear_resets() {
        let mut sample = UniformSample::new(2);
        sample.push(1);
        sample.clear();
        assert!(sample.is_empty());
        assert_eq!(sample.count(), 0);
    }

    proptest! {
        #[test]
        fn reservoir_only_holds_pushed_values(n in 1u32..200) {
            let mut sample = UniformSample::new(8);
            for i in 0..n {
                sample.push(i);
            }
            prop_assert_eq!(sample.len() as u64, sample.count().min(8));
            for v in sample.iter() {
                prop_assert!(*v < n);
            }
        }
    }
}
