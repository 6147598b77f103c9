//! Completed questionnaire results. Rows are insert-only.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{SharedError, SharedResult};

/// Accepted IQ range. Anything outside it is a client bug.
pub const IQ_RANGE: std::ops::RangeInclusive<i32> = 40..=200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    Iq,
    Personality,
    Adhd,
    Anxiety,
    Depression,
    Eq,
}

impl TestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::Iq => "iq",
            TestKind::Personality => "personality",
            TestKind::Adhd => "adhd",
            TestKind::Anxiety => "anxiety",
            TestKind::Depression => "depression",
            TestKind::Eq => "eq",
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestKind {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "iq" => Ok(TestKind::Iq),
            "personality" => Ok(TestKind::Personality),
            "adhd" => Ok(TestKind::Adhd),
            "anxiety" => Ok(TestKind::Anxiety),
            "depression" => Ok(TestKind::Depression),
            "eq" => Ok(TestKind::Eq),
            other => Err(SharedError::UnknownVariant {
                kind: "test kind",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for TestKind {
    type Error = SharedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TestResult {
    pub id: Uuid,
    pub user_id: Uuid,
    #[sqlx(try_from = "String")]
    pub test_kind: TestKind,
    pub iq: Option<i32>,
    pub scores: serde_json::Value,
    pub answers: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
}

/// Payload for storing a finished questionnaire. Scores arrive precomputed.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTestResult {
    pub test_kind: TestKind,
    pub iq: Option<i32>,
    #[serde(default = "empty_object")]
    pub scores: serde_json::Value,
    #[serde(default = "empty_array")]
    pub answers: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn empty_array() -> serde_json::Value {
    serde_json::Value::Array(Vec::new())
}

impl NewTestResult {
    /// Category scores must be a flat object of numbers; `iq` belongs to IQ tests only.
    pub fn validate(&self) -> SharedResult<()> {
        match (self.test_kind, self.iq) {
            (TestKind::Iq, None) => {
                return Err(SharedError::Validation("iq is required for iq tests".into()))
            }
            (TestKind::Iq, Some(iq)) if !IQ_RANGE.contains(&iq) => {
                return Err(SharedError::Validation(format!(
                    "iq {iq} outside {}..={}",
                    IQ_RANGE.start(),
                    IQ_RANGE.end()
                )))
            }
            (kind, Some(_)) if kind != TestKind::Iq => {
                return Err(SharedError::Validation(format!(
                    "iq is only valid for iq tests, not {kind}"
                )))
            }
            _ => {}
        }

        let scores = self
            .scores
            .as_object()
            .ok_or_else(|| SharedError::Validation("scores must be an object".into()))?;

        if let Some((name, _)) = scores.iter().find(|(_, v)| !v.is_number()) {
            return Err(SharedError::Validation(format!(
                "score '{name}' must be numeric"
            )));
        }

        if !self.answers.is_array() {
            return Err(SharedError::Validation("answers must be an array".into()));
        }

        Ok(())
    }
}

impl TestResult {
    pub async fn insert<'e, E>(
        executor: E,
        user_id: Uuid,
        input: &NewTestResult,
    ) -> SharedResult<TestResult>
    where
        E: PgExecutor<'e>,
    {
        input.validate()?;

        let row = sqlx::query_as::<_, TestResult>(
            r#"
            INSERT INTO test_results (user_id, test_kind, iq, scores, answers)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, user_id, test_kind, iq, scores, answers, completed_at
            "#,
        )
        .bind(user_id)
        .bind(input.test_kind.as_str())
        .bind(input.iq)
        .bind(&input.scores)
        .bind(&input.answers)
        .fetch_one(executor)
        .await?;

        Ok(row)
    }

    pub async fn list_for_user<'e, E>(executor: E, user_id: Uuid) -> SharedResult<Vec<TestResult>>
    where
        E: PgExecutor<'e>,
    {
        let rows = sqlx::query_as::<_, TestResult>(
            r#"
            SELECT id, user_id, test_kind, iq, scores, answers, completed_at
            FROM test_results
            WHERE user_id = $1
            ORDER BY completed_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(executor)
        .await?;

        Ok(rows)
    }

    pub async fn find_for_user<'e, E>(
        executor: E,
        user_id: Uuid,
        id: Uuid,
    ) -> SharedResult<Option<TestResult>>
    where
        E: PgExecutor<'e>,
    {
        let row = sqlx::query_as::<_, TestResult>(
            r#"
            SELECT id, user_id, test_kind, iq, scores, answers, completed_at
            FROM test_results
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(executor)
        .await?;

        Ok(row)
    }
}
