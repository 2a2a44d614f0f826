// src/clock.rs
use chrono::{Local, NaiveDate, NaiveDateTime};

/// Source of "now" for the pipeline.
///
/// BioTime reports punch times in the terminal's local time without an offset,
/// so everything downstream works on naive local date-times.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

#[cfg(test)]
pub use test_clock::TestClock;
