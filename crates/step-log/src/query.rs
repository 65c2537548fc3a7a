use chrono::{DateTime, Utc};

use crate::{SagaInstance, SagaStatus};

/// Builder for scanning saga instances by predicate.
///
/// Results are always ordered by creation time, oldest first.
#[derive(Debug, Clone, Default)]
pub struct SagaQuery {
    /// Filter by status (any of these statuses).
    pub statuses: Option<Vec<SagaStatus>>,

    /// Only sagas last updated at or before this timestamp.
    pub updated_before: Option<DateTime<Utc>>,

    /// Maximum number of sagas to return.
    pub limit: Option<usize>,

    /// Number of sagas to skip.
    pub offset: Option<usize>,
}

impl SagaQuery {
    /// Creates a new empty query matching every saga.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for sagas that still need driving.
    pub fn non_terminal() -> Self {
        Self {
            statuses: Some(vec![SagaStatus::Running, SagaStatus::Compensating]),
            ..Default::default()
        }
    }

    /// Filters by a single status.
    pub fn status(mut self, status: SagaStatus) -> Self {
        self.statuses = Some(vec![status]);
        self
    }

    /// Filters by several statuses (any of these).
    pub fn statuses(mut self, statuses: Vec<SagaStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    /// Filters to sagas idle since at least `timestamp`.
    pub fn updated_before(mut self, timestamp: DateTime<Utc>) -> Self {
        self.updated_before = Some(timestamp);
        self
    }

    /// Limits the number of sagas returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips this many sagas before returning results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if `saga` satisfies the filters (ignores paging).
    pub fn matches(&self, saga: &SagaInstance) -> bool {
        if let Some(ref statuses) = self.statuses
            && !statuses.contains(&saga.status)
        {
            return false;
        }
        if let Some(before) = self.updated_before
            && saga.updated_at > before
        {
            return false;
        }
        true
    }

    /// Status names used as SQL parameters.
    pub(crate) fn status_names(&self) -> Option<Vec<String>> {
        self.statuses
            .as_ref()
            .map(|statuses| statuses.iter().map(|s| s.as_str().to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SagaId, StepDefinition};

    #[test]
    fn non_terminal_query() {
        let query = SagaQuery::non_terminal();
        assert_eq!(
            query.statuses,
            Some(vec![SagaStatus::Running, SagaStatus::Compensating])
        );
        assert!(query.limit.is_none());
    }

    #[test]
    fn query_builder_chain() {
        let now = Utc::now();
        let query = SagaQuery::new()
            .status(SagaStatus::Failed)
            .updated_before(now)
            .limit(10)
            .offset(5);

        assert_eq!(query.statuses, Some(vec![SagaStatus::Failed]));
        assert_eq!(query.updated_before, Some(now));
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.offset, Some(5));
        assert_eq!(query.status_names(), Some(vec!["Failed".to_string()]));
    }

    #[test]
    fn matches_filters_by_status() {
        let saga = SagaInstance::new(
            SagaId::new(),
            vec![StepDefinition::new("noop", serde_json::Value::Null)],
        );
        assert!(SagaQuery::new().matches(&saga));
        assert!(SagaQuery::non_terminal().matches(&saga));
        assert!(!SagaQuery::new().status(SagaStatus::Committed).matches(&saga));
        assert!(
            !SagaQuery::new()
                .updated_before(saga.updated_at - chrono::Duration::seconds(1))
                .matches(&saga)
        );
    }
}
