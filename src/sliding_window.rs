// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Windowing over a 1-D buffer of samples or feature vectors.

use canonical_error::{CanonicalError, invalid_argument_error};

/// Successive full windows of `size` elements, advancing `stride` elements
/// each step. Windows overlap when `stride < size`.
#[derive(Clone, Debug)]
pub struct SlidingWindow<'a, T> {
    data: &'a [T],
    size: usize,
    stride: usize,
    count: usize,
}

impl<'a, T> SlidingWindow<'a, T> {
    pub fn new(data: &'a [T], size: usize, stride: usize) -> Result<Self, CanonicalError> {
        if stride == 0 || size == 0 {
            return Err(invalid_argument_error(
                format!("Window size {} and stride {} must be non-zero", size, stride).as_str()));
        }
        Ok(SlidingWindow{data, size, stride, count: 0})
    }

    pub fn has_next(&self) -> bool {
        self.size + self.count * self.stride <= self.data.len()
    }

    /// Returns the next window and advances, or `None` when no full window
    /// remains.
    pub fn next_window(&mut self) -> Option<&'a [T]> {
        if !self.has_next() {
            return None;
        }
        let start = self.next_window_start_index();
        self.count += 1;
        Some(&self.data[start..start + self.size])
    }

    /// Index of the window most recently returned; 0 before the first.
    pub fn index(&self) -> usize {
        self.count.saturating_sub(1)
    }

    pub fn next_window_start_index(&self) -> usize {
        self.count * self.stride
    }

    /// Number of strides over the whole buffer, one less than the number of
    /// full windows. Zero if not even one window fits.
    pub fn total_strides(&self) -> usize {
        if self.size > self.data.len() {
            return 0;
        }
        (self.data.len() - self.size) / self.stride
    }

    pub fn window_size(&self) -> usize {
        self.size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

impl<'a, T> Iterator for SlidingWindow<'a, T> {
    type Item = &'a [T];

    fn next(&mut self) -> Option<Self::Item> {
        self.next_window()
    }
}

/// Like `SlidingWindow`, but keeps going while any of the data has not been
/// covered, so the final window may be shorter than `size`. Callers check
/// `next_window_start_index()` against the data length to learn how much
/// of the tail window is real.
#[derive(Clone, Debug)]
pub struct FractionalSlidingWindow<'a, T> {
    inner: SlidingWindow<'a, T>,
}

impl<'a, T> FractionalSlidingWindow<'a, T> {
    pub fn new(data: &'a [T], size: usize, stride: usize) -> Result<Self, CanonicalError> {
        Ok(FractionalSlidingWindow{inner: SlidingWindow::new(data, size, stride)?})
    }

    /// Number of strides, counting a trailing partial window as a whole one.
    pub fn fractional_total_strides(&self) -> usize {
        let len = self.inner.data.len();
        let size = self.inner.size;
        if size > len {
            // Integer division; 0 for any window larger than the data.
            len / size
        } else {
            (len - size).div_ceil(self.inner.stride)
        }
    }

    pub fn has_next(&self) -> bool {
        self.inner.count < 1 + self.fractional_total_strides()
            && self.inner.next_window_start_index() < self.inner.data.len()
    }

    /// Returns the next window, truncated at the end of the data.
    pub fn next_window(&mut self) -> Option<&'a [T]> {
        if !self.has_next() {
            return None;
        }
        let start = self.inner.next_window_start_index();
        let end = (start + self.inner.size).min(self.inner.data.len());
        self.inner.count += 1;
        Some(&self.inner.data[start..end])
    }

    pub fn index(&self) -> usize {
        self.inner.index()
    }

    pub fn next_window_start_index(&self) -> usize {
        self.inner.next_window_start_index()
    }

    pub fn total_strides(&self) -> usize {
        self.inner.total_strides()
    }

    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

impl<'a, T> Iterator for FractionalSlidingWindow<'a, T> {
    type Item = &'a [T];

    fn next(&mut self) -> Option<Self::Item> {
        self.next_window()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_zero_stride() {
        let data = [0u8; 4];
        assert!(SlidingWindow::new(&data, 2, 0).is_err());
        assert!(FractionalSlidingWindow::new(&data, 0, 1).is_err());
    }

    #[test]
    fn test_windows_cover_buffer() {
        for total in 1..24usize {
            for size in 1..=total {
                for stride in 1..=size {
                    let data: Vec<usize> = (0..total).collect();
                    let mut w = SlidingWindow::new(&data, size, stride).unwrap();
                    let mut covered = vec![0usize; total];
                    let mut calls = 0;
                    while w.has_next() {
                        let expected_start = w.next_window_start_index();
                        let window = w.next_window().unwrap();
                        assert_eq!(window.len(), size);
                        assert_eq!(window[0], expected_start);
                        for &i in window {
                            covered[i] += 1;
                        }
                        calls += 1;
                        assert_eq!(w.index(), calls - 1);
                    }
                    assert_eq!(w.total_strides(), calls - 1);
                    assert!(w.next_window().is_none());
                    // Everything up to the last full window is covered.
                    let end = calls - 1;
                    let last = end * stride + size;
                    assert!(covered[..last].iter().all(|c| *c > 0));
                    assert!(covered[last..].iter().all(|c| *c == 0));
                    assert!(total - last < stride);
                }
            }
        }
    }

    #[test]
    fn test_overlap_and_reset() {
        let data = [1, 2, 3, 4, 5, 6];
        let mut w = SlidingWindow::new(&data, 4, 2).unwrap();
        assert_eq!(w.index(), 0);
        let windows: Vec<&[i32]> = w.by_ref().collect();
        assert_eq!(windows, vec![&[1, 2, 3, 4][..], &[3, 4, 5, 6][..]]);
        assert_eq!(w.index(), 1);
        w.reset();
        assert_eq!(w.next_window(), Some(&[1, 2, 3, 4][..]));
    }

    #[test]
    fn test_window_larger_than_data() {
        let data = [1, 2, 3];
        let w = SlidingWindow::new(&data, 4, 1).unwrap();
        assert!(!w.has_next());
        assert_eq!(w.total_strides(), 0);
    }

    #[test]
    fn test_fractional_tail() {
        let data: Vec<i32> = (0..10).collect();
        let mut w = FractionalSlidingWindow::new(&data, 4, 3).unwrap();
        assert_eq!(w.fractional_total_strides(), 2);
        assert_eq!(w.total_strides(), 2);
        let windows: Vec<Vec<i32>> = w.by_ref().map(|s| s.to_vec()).collect();
        assert_eq!(windows, vec![vec![0, 1, 2, 3], vec![3, 4, 5, 6], vec![6, 7, 8, 9]]);

        let data: Vec<i32> = (0..11).collect();
        let mut w = FractionalSlidingWindow::new(&data, 4, 3).unwrap();
        assert_eq!(w.fractional_total_strides(), 3);
        let mut lens = Vec::new();
        while w.has_next() {
            let start = w.next_window_start_index();
            let window = w.next_window().unwrap();
            assert_eq!(window.len(), 4.min(data.len() - start));
            lens.push(window.len());
        }
        assert_eq!(lens, vec![4, 4, 4, 2]);
    }

    #[test]
    fn test_fractional_short_data() {
        let data = [1, 2, 3];
        let mut w = FractionalSlidingWindow::new(&data, 4, 2).unwrap();
        assert_eq!(w.fractional_total_strides(), 0);
        assert_eq!(w.next_window(), Some(&[1, 2, 3][..]));
        assert!(!w.has_next());
    }
}
