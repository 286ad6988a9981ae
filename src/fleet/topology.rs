use crate::models::job::WorkerKind;
use crate::services::bus::{
    BusError, GroupStart, MessageBus, ACK_TOPIC, AGGREGATOR_GROUP, INGEST_GROUP, JOBS_TOPIC,
    RESULTS_TOPIC,
};

/// Consumer groups each topic needs before any process starts.
pub fn consumer_groups() -> Vec<(&'static str, Vec<&'static str>)> {
    vec![
        (
            JOBS_TOPIC,
            WorkerKind::ALL.iter().map(WorkerKind::consumer_group).collect(),
        ),
        (RESULTS_TOPIC, vec![AGGREGATOR_GROUP]),
        (ACK_TOPIC, vec![INGEST_GROUP]),
    ]
}

/// Drop every known topic and recreate its consumer groups from the start
/// of the (new, empty) topic. Existing groups are not an error.
pub async fn reset_topology<B: MessageBus + ?Sized>(bus: &B) -> Result<(), BusError> {
    tracing::info!("Resetting bus topology");
    for (topic, groups) in consumer_groups() {
        bus.delete_topic(topic).await?;
        tracing::debug!(topic, "Deleted topic");
        for group in groups {
            bus.create_group(topic, group, GroupStart::Beginning, true)
                .await?;
            tracing::info!(topic, group, "Created consumer group");
        }
    }
    Ok(())
}
