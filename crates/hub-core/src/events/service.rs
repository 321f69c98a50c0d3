//! Event Service: persist-then-publish with historical query and live
//! subscription.
//!
//! Grounded in `NatsEventStore` (JetStream publish + a stream-backed store),
//! adapted from one subject per workflow run to a single wildcard subject
//! space (`hub.events.<subject>`) with a Postgres projection serving
//! `Query`, since historical filtering (subject pattern, correlation id,
//! time range, keyset pagination) is a poor fit for JetStream consumers
//! alone.

use anyhow::{Context, Result};
use async_nats::jetstream::{self, stream::RetentionPolicy, stream::StorageType};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use hub_db::models::Event;
use hub_db::queries::events::{self, EventFilter};

const EVENTS_STREAM_NAME: &str = "HUB_EVENTS";
const EVENTS_SUBJECT_PREFIX: &str = "hub.events";

/// Publishes to and queries the Event Service's persist-then-publish pipeline.
pub struct EventService {
    pool: PgPool,
    jetstream: jetstream::Context,
}

impl EventService {
    /// Connect to NATS and ensure the durable events stream exists.
    pub async fn connect(pool: PgPool, nats_url: &str) -> Result<Self> {
        let client = async_nats::connect(nats_url)
            .await
            .with_context(|| format!("failed to connect to NATS at {nats_url}"))?;
        let jetstream = async_nats::jetstream::new(client);

        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: EVENTS_STREAM_NAME.to_string(),
                subjects: vec![format!("{EVENTS_SUBJECT_PREFIX}.>")],
                storage: StorageType::File,
                retention: RetentionPolicy::Limits,
                ..Default::default()
            })
            .await
            .context("failed to create events stream")?;

        Ok(Self { pool, jetstream })
    }

    /// `Publish(subject, payload, origin, correlationId?)`. Commits to the
    /// store before attempting a bus publish; a publish failure after
    /// commit is non-fatal, the event is durable and will be delivered by
    /// the background re-publisher.
    pub async fn publish(
        &self,
        subject: &str,
        payload: &Value,
        origin: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<Uuid> {
        let event = events::insert_event(&self.pool, subject, origin, correlation_id, payload)
            .await
            .context("failed to persist event")?;

        if let Err(e) = self.publish_to_bus(&event).await {
            tracing::warn!(event_id = %event.id, subject, error = %e, "bus publish failed, will be retried by republisher");
        } else if let Err(e) = events::mark_published(&self.pool, event.id).await {
            tracing::warn!(event_id = %event.id, error = %e, "failed to mark event published after successful bus publish");
        }

        Ok(event.id)
    }

    pub(crate) async fn publish_to_bus(&self, event: &Event) -> Result<()> {
        let bus_subject = format!("{EVENTS_SUBJECT_PREFIX}.{}", event.subject);
        let bytes = serde_json::to_vec(event).context("failed to serialize event")?;
        self.jetstream
            .publish(bus_subject, bytes.into())
            .await
            .context("jetstream publish failed")?
            .await
            .context("jetstream publish ack failed")?;
        Ok(())
    }

    /// `Query(filter)`. Ordered by (timestamp, id) ascending.
    pub async fn query(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        events::query_events(&self.pool, filter)
            .await
            .context("failed to query events")
    }

    /// Round-trip check against the bus, used by `/health/bus`.
    pub async fn ping(&self) -> Result<()> {
        self.jetstream
            .get_stream(EVENTS_STREAM_NAME)
            .await
            .context("event bus unreachable")?;
        Ok(())
    }

    /// `Subscribe(pattern)`. Translates a dotted subject pattern
    /// (`*`/`>` tokens) into the corresponding JetStream filter and
    /// returns an ephemeral pull consumer's message stream. Delivery is
    /// at-least-once; callers deduplicate by event id.
    pub async fn subscribe(&self, pattern: &str) -> Result<jetstream::consumer::PullConsumer> {
        let filter_subject = format!("{EVENTS_SUBJECT_PREFIX}.{pattern}");
        let stream = self
            .jetstream
            .get_stream(EVENTS_STREAM_NAME)
            .await
            .context("failed to get events stream")?;

        let consumer = stream
            .create_consumer(jetstream::consumer::pull::Config {
                filter_subject,
                deliver_policy: jetstream::consumer::DeliverPolicy::New,
                ..Default::default()
            })
            .await
            .context("failed to create ephemeral consumer")?;

        Ok(consumer)
    }
}

/// Translate a dotted subject pattern with `*`/`>` wildcards into a SQL
/// `LIKE` pattern over the `subject` column, for the query-side filter
/// (the bus-side filter uses the pattern directly, JetStream understands
/// the same wildcard tokens natively).
pub fn pattern_to_like(pattern: &str) -> String {
    pattern
        .split('.')
        .map(|token| match token {
            "*" => "%".to_string(),
            ">" => "%".to_string(),
            other => other.replace('%', "\\%").replace('_', "\\_"),
        })
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_token_wildcard_becomes_like() {
        assert_eq!(pattern_to_like("hub.*.project.started"), "hub.%.project.started");
    }

    #[test]
    fn tail_wildcard_becomes_like() {
        assert_eq!(pattern_to_like("hub.proj-1.>"), "hub.proj-1.%");
    }

    #[test]
    fn literal_pattern_is_escaped() {
        assert_eq!(pattern_to_like("hub.events.exact"), "hub.events.exact");
    }
}
