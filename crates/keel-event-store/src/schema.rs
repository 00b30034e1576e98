//! Table layout and statements shared by the Postgres stores.
//!
//! The DDL itself lives in `migrations/` at the workspace root.

/// Name of the append-only event table.
pub const EVENTS_TABLE: &str = "domain_events";

/// Name of the projection table.
pub const PROJECTIONS_TABLE: &str = "projections";

pub(crate) const SELECT_EVENTS: &str = r"
SELECT event_id, aggregate_id, event_kind, payload, version,
       correlation_id, causation_id, occurred_on
FROM domain_events
WHERE aggregate_id = $1
ORDER BY version
";

pub(crate) const INSERT_EVENT: &str = r"
INSERT INTO domain_events
    (event_id, aggregate_id, event_kind, payload, version,
     correlation_id, causation_id, occurred_on)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
";

pub(crate) const HIGHEST_VERSION: &str = r"
SELECT COALESCE(MAX(version), 0)
FROM domain_events
WHERE aggregate_id = $1
";

pub(crate) const UPSERT_PROJECTION: &str = r"
INSERT INTO projections (projection, aggregate_id, version, state)
VALUES ($1, $2, $3, $4)
ON CONFLICT (projection, aggregate_id)
DO UPDATE SET version = EXCLUDED.version,
              state = EXCLUDED.state,
              updated_at = NOW()
";

pub(crate) const SELECT_PROJECTION: &str = r"
SELECT projection, aggregate_id, version, state
FROM projections
WHERE projection = $1 AND aggregate_id = $2
";

pub(crate) const FIND_PROJECTIONS: &str = r"
SELECT projection, aggregate_id, version, state
FROM projections
WHERE projection = $1 AND state ->> $2 = $3
ORDER BY aggregate_id
";

pub(crate) const LIST_PROJECTIONS: &str = r"
SELECT projection, aggregate_id, version, state
FROM projections
WHERE projection = $1
ORDER BY aggregate_id
";

pub(crate) const MARK_PUBLISHED: &str = r"
UPDATE domain_events
SET published_at = NOW()
WHERE event_id = ANY($1) AND published_at IS NULL
";

pub(crate) const SELECT_UNPUBLISHED: &str = r"
SELECT event_id, aggregate_id, event_kind, payload, version,
       correlation_id, causation_id, occurred_on
FROM domain_events
WHERE published_at IS NULL AND occurred_on < $1
ORDER BY occurred_on, aggregate_id, version
LIMIT $2
";
