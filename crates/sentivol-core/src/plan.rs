//! Merge statement intermediate representation and its BigQuery rendering.
//!
//! A [`MergePlan`] is built once per upsert, executed by a warehouse and, on
//! failure, rendered into the error so the statement can be replayed by hand.

use serde::Serialize;

use crate::TableRef;

/// Column carrying the per-key row number inside the deduplicating subquery.
pub const RANK_COLUMN: &str = "_row_rank";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// Why a ranking was chosen; kept for logs and assertions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "column", rename_all = "snake_case")]
pub enum RankingBasis {
    /// One of the configured recency columns (`ingested_at`, `published_at`, ...).
    Recency(String),
    /// An event-time column picked because no recency column was usable.
    EventTime(String),
    /// Nothing time-like was usable: ordered by the key columns themselves.
    KeyColumns,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderTerm {
    pub column: String,
    /// Wrap the column in `SAFE_CAST(.. AS TIMESTAMP)` before ordering.
    pub cast_to_timestamp: bool,
    pub direction: SortDirection,
}

impl OrderTerm {
    pub fn recency(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            cast_to_timestamp: true,
            direction: SortDirection::Desc,
        }
    }

    pub fn ascending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            cast_to_timestamp: false,
            direction: SortDirection::Asc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ranking {
    pub basis: RankingBasis,
    pub partition_by: Vec<String>,
    pub order_by: Vec<OrderTerm>,
}

/// `MERGE target USING (dedup(source)) ON keys ...` as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergePlan {
    pub target: TableRef,
    pub source: TableRef,
    pub on_columns: Vec<String>,
    pub update_columns: Vec<String>,
    pub insert_columns: Vec<String>,
    pub ranking: Ranking,
}

/// Backtick-quotes an identifier, escaping embedded backticks and backslashes.
pub fn quote_ident(ident: &str) -> String {
    let escaped = ident.replace('\\', "\\\\").replace('`', "\\`");
    format!("`{escaped}`")
}

fn quote_table(table: &TableRef) -> String {
    quote_ident(&table.to_string())
}

fn render_order_term(term: &OrderTerm) -> String {
    let column = quote_ident(&term.column);
    if term.cast_to_timestamp {
        format!("SAFE_CAST({column} AS TIMESTAMP) {}", term.direction.as_sql())
    } else {
        format!("{column} {}", term.direction.as_sql())
    }
}

impl MergePlan {
    /// Renders BigQuery standard SQL. The `WHEN MATCHED` arm is omitted when
    /// every usable column is a key column.
    pub fn render(&self) -> String {
        let select_cols = self
            .insert_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let partition = self
            .ranking
            .partition_by
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let order = self
            .ranking
            .order_by
            .iter()
            .map(render_order_term)
            .collect::<Vec<_>>()
            .join(", ");
        let on_clause = self
            .on_columns
            .iter()
            .map(|c| format!("T.{col} = S.{col}", col = quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let insert_vals = self
            .insert_columns
            .iter()
            .map(|c| format!("S.{}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "MERGE {target} T\n\
             USING (\n  \
               SELECT * EXCEPT({rank}) FROM (\n    \
                 SELECT\n      \
                   {select_cols},\n      \
                   ROW_NUMBER() OVER (\n        \
                     PARTITION BY {partition}\n        \
                     ORDER BY {order}\n      \
                   ) AS {rank}\n    \
                 FROM {source}\n  \
               )\n  \
               WHERE {rank} = 1\n\
             ) S\n\
             ON {on_clause}\n",
            target = quote_table(&self.target),
            source = quote_table(&self.source),
            rank = RANK_COLUMN,
        );

        if !self.update_columns.is_empty() {
            let assignments = self
                .update_columns
                .iter()
                .map(|c| format!("T.{col} = S.{col}", col = quote_ident(c)))
                .collect::<Vec<_>>()
                .join(",\n    ");
            sql.push_str("WHEN MATCHED THEN\n  UPDATE SET\n    ");
            sql.push_str(&assignments);
            sql.push('\n');
        }

        sql.push_str(&format!(
            "WHEN NOT MATCHED THEN\n  INSERT ({select_cols})\n  VALUES ({insert_vals});"
        ));
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(update_columns: Vec<&str>) -> MergePlan {
        MergePlan {
            target: "proj.ds.news_articles".parse().expect("target"),
            source: "proj.ds.news_articles_staging".parse().expect("staging"),
            on_columns: vec!["article_id".into()],
            update_columns: update_columns.into_iter().map(String::from).collect(),
            insert_columns: vec!["article_id".into(), "title".into(), "ingested_at".into()],
            ranking: Ranking {
                basis: RankingBasis::Recency("ingested_at".into()),
                partition_by: vec!["article_id".into()],
                order_by: vec![OrderTerm::recency("ingested_at")],
            },
        }
    }

    #[test]
    fn renders_dedup_subquery_and_both_arms() {
        let sql = plan(vec!["title", "ingested_at"]).render();
        assert!(sql.starts_with("MERGE `proj.ds.news_articles` T\n"));
        assert!(sql.contains("FROM `proj.ds.news_articles_staging`"));
        assert!(sql.contains("PARTITION BY `article_id`"));
        assert!(sql.contains("ORDER BY SAFE_CAST(`ingested_at` AS TIMESTAMP) DESC"));
        assert!(sql.contains("WHERE _row_rank = 1"));
        assert!(sql.contains("ON T.`article_id` = S.`article_id`"));
        assert!(sql.contains("T.`title` = S.`title`,\n    T.`ingested_at` = S.`ingested_at`"));
        assert!(sql.contains("INSERT (`article_id`, `title`, `ingested_at`)"));
        assert!(sql.ends_with("VALUES (S.`article_id`, S.`title`, S.`ingested_at`);"));
    }

    #[test]
    fn key_only_merge_has_no_update_arm() {
        let sql = plan(vec![]).render();
        assert!(!sql.contains("WHEN MATCHED"));
        assert!(sql.contains("WHEN NOT MATCHED THEN"));
    }

    #[test]
    fn identifiers_are_escaped() {
        assert_eq!(quote_ident("we`ird"), "`we\\`ird`");
        assert_eq!(quote_ident(r"back\slash"), r"`back\\slash`");
    }

    #[test]
    fn ascending_terms_skip_the_cast() {
        assert_eq!(render_order_term(&OrderTerm::ascending("id")), "`id` ASC");
    }
}
