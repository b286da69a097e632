use std::cmp::min;

/// Marches over `[0, end_pos)` in steps of `interval`, wrapping around at the end.
///
/// ```
/// use pulsectrl_backend::utils::StreamCounter;
///
/// let mut counter = StreamCounter::new(10, 4);
/// assert_eq!(counter.tick_next(), (0, 4));
/// assert_eq!(counter.tick_next(), (4, 8));
/// assert_eq!(counter.tick_next(), (8, 10));
/// assert_eq!(counter.tick_next(), (0, 4));
/// ```
pub struct StreamCounter {
    pos: usize,
    end_pos: usize,
    interval: usize,
}

impl StreamCounter {
    pub fn new(end_pos: usize, interval: usize) -> Self {
        Self {
            pos: 0,
            end_pos,
            interval: interval.max(1),
        }
    }

    pub fn next_pos(&self) -> usize {
        min(self.pos + self.interval, self.end_pos)
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn tick_next(&mut self) -> (usize, usize) {
        let result = (self.pos(), self.next_pos());
        self.pos = self.next_pos();
        if self.pos == self.end_pos {
            self.pos = 0
        }
        result
    }

    /// All chunks of one pass, from the current position to the end.
    pub fn chunks(&mut self) -> Vec<(usize, usize)> {
        let mut chunks = Vec::new();
        if self.end_pos == 0 {
            return chunks;
        }
        loop {
            let (start, end) = self.tick_next();
            chunks.push((start, end));
            if end == self.end_pos {
                return chunks;
            }
        }
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
