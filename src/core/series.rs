// src/core/series.rs
use crate::types::Candle;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesUpdate {
    /// A new bucket started.
    Appended,
    /// The in-progress candle changed.
    Updated,
    /// Older than the last candle, or a repeat for a candle that already closed.
    Stale,
}

/// Fixed-capacity window of candles ordered by open time.
///
/// Only the newest candle can change, and only while it is still open.
#[derive(Debug, Clone)]
pub struct CandleSeries {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl CandleSeries {
    pub fn new(capacity: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity + 1),
            capacity: capacity.max(1),
        }
    }

    pub fn with_history(capacity: usize, history: Vec<Candle>) -> Self {
        let mut series = Self::new(capacity);
        for candle in history {
            series.apply(candle);
        }
        series
    }

    pub fn apply(&mut self, candle: Candle) -> SeriesUpdate {
        let Some(last) = self.candles.back_mut() else {
            self.candles.push_back(candle);
            return SeriesUpdate::Appended;
        };

        if candle.open_time > last.open_time {
            self.candles.push_back(candle);
            while self.candles.len() > self.capacity {
                self.candles.pop_front();
            }
            return SeriesUpdate::Appended;
        }

        if candle.open_time < last.open_time || last.is_closed {
            return SeriesUpdate::Stale;
        }

        last.open = candle.open;
        last.high = last.high.max(candle.high);
        last.low = last.low.min(candle.low);
        last.close = candle.close;
        last.volume = candle.volume;
        last.close_time = candle.close_time;
        last.is_closed = candle.is_closed;
        SeriesUpdate::Updated
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&mut self) -> &[Candle] {
        self.candles.make_contiguous()
    }
}
