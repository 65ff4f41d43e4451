//! Paginated run summaries written next to each applied upsert.

use sentivol_core::{row_value, Batch, KeySpec};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub total_records: usize,
    pub current_page: usize,
    pub total_pages: usize,
    pub next_page: Option<usize>,
    pub prev_page: Option<usize>,
}

impl Pagination {
    /// First page of `total_records` split into pages of `page_size`. A zero
    /// page size yields zero pages.
    pub fn first_page(total_records: usize, page_size: usize) -> Self {
        let total_pages = if page_size == 0 {
            0
        } else {
            total_records.div_ceil(page_size)
        };
        Self {
            total_records,
            current_page: 1,
            total_pages,
            next_page: (total_pages > 1).then_some(2),
            prev_page: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub data: Vec<Map<String, JsonValue>>,
    pub pagination: Pagination,
}

fn page_of(index: usize, page_size: usize) -> usize {
    if page_size == 0 {
        1
    } else {
        index / page_size + 1
    }
}

/// One entry per row: its key columns, the recency column when there is one,
/// and the page the row falls on.
pub fn summarize(
    batch: &Batch,
    keys: &KeySpec,
    recency_column: Option<&str>,
    page_size: usize,
) -> RunSummary {
    let data = batch
        .rows()
        .iter()
        .enumerate()
        .map(|(index, row)| {
            let mut entry = Map::new();
            for key in keys.iter() {
                entry.insert(key.to_string(), row_value(row, key).to_json());
            }
            if let Some(column) = recency_column {
                entry.insert(column.to_string(), row_value(row, column).to_json());
            }
            entry.insert("page_number".to_string(), JsonValue::from(page_of(index, page_size)));
            entry
        })
        .collect::<Vec<_>>();

    RunSummary {
        pagination: Pagination::first_page(data.len(), page_size),
        data,
    }
}
