use chrono::{FixedOffset, NaiveDate};

use crate::domain::{HistoryRecord, Rate, Tenor};

/// An ordered (oldest first) slice of one tenor's history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryWindow {
    tenor: Tenor,
    records: Vec<HistoryRecord>,
}

impl HistoryWindow {
    pub fn new(tenor: Tenor, records: Vec<HistoryRecord>) -> Self {
        Self { tenor, records }
    }

    pub fn tenor(&self) -> Tenor {
        self.tenor
    }

    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HistoryRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn values(&self) -> Vec<Rate> {
        self.records.iter().map(|r| r.value).collect()
    }

    pub fn latest(&self) -> Option<&HistoryRecord> {
        self.records.last()
    }

    /// Last value of each local calendar day strictly before `before`,
    /// keeping the most recent `limit` days (oldest first).
    pub fn daily_closes(
        &self,
        offset: FixedOffset,
        before: NaiveDate,
        limit: usize,
    ) -> Vec<(NaiveDate, Rate)> {
        let mut closes: Vec<(NaiveDate, Rate)> = Vec::new();
        for record in &self.records {
            let day = record.observed_at.with_timezone(&offset).date_naive();
            if day >= before {
                continue;
            }
            match closes.last_mut() {
                Some((last_day, value)) if *last_day == day => *value = record.value,
                _ => closes.push((day, record.value)),
            }
        }
        let skip = closes.len().saturating_sub(limit);
        closes.split_off(skip)
    }
}

impl IntoIterator for HistoryWindow {
    type Item = HistoryRecord;
    type IntoIter = std::vec::IntoIter<HistoryRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a HistoryWindow {
    type Item = &'a HistoryRecord;
    type IntoIter = std::slice::Iter<'a, HistoryRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
