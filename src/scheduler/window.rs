//! Preload window arithmetic

use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::document::DocumentId;

/// Pages kept warm around the page being viewed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadWindow {
    pub document: DocumentId,
    pub center: usize,
    pub radius: usize,
    pub first: usize,
    pub last: usize,
    pub computed_at: DateTime<Utc>,
}

impl PreloadWindow {
    /// Window `[center - radius, center + radius]` clipped to the document
    ///
    /// Returns `None` for an empty document. A center past the end is
    /// clamped to the last page.
    pub fn compute(
        document: DocumentId,
        center: usize,
        radius: usize,
        total_pages: usize,
    ) -> Option<Self> {
        let last_page = total_pages.checked_sub(1)?;
        let center = center.min(last_page);
        Some(Self {
            document,
            center,
            radius,
            first: center.saturating_sub(radius),
            last: center.saturating_add(radius).min(last_page),
            computed_at: Utc::now(),
        })
    }

    pub fn pages(&self) -> RangeInclusive<usize> {
        self.first..=self.last
    }

    pub fn contains(&self, page: usize) -> bool {
        self.pages().contains(&page)
    }

    /// Whether `page` lies more than twice the radius from the center
    pub fn is_far(&self, page: usize) -> bool {
        page.abs_diff(self.center) > self.radius.saturating_mul(2)
    }

    /// Window pages nearest the center first; lower page wins a tie
    pub fn by_distance(&self) -> Vec<usize> {
        let mut pages: Vec<usize> = self.pages().collect();
        pages.sort_by_key(|page| (page.abs_diff(self.center), *page));
        pages
    }
}
