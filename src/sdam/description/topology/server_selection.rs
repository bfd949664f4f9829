#[cfg(test)]
mod test;

use std::time::Duration;

use rand::Rng;

use super::{TopologyDescription, TopologyType};
use crate::{
    error::{Error, ErrorKind, Result},
    sdam::description::server::{ServerDescription, ServerId, ServerType},
    selection_criteria::{OperationType, ReadMode, ReadPreference, TagSet},
};

pub(crate) const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);
const SMALLEST_MAX_STALENESS: Duration = Duration::from_secs(90);

/// Servers older than this cannot run an aggregation with `$out` or `$merge` on a secondary.
const AGGREGATE_WITH_WRITE_ON_SECONDARY_WIRE_VERSION: i32 = 13;

/// The outcome of a successful selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedServer {
    /// The id of the chosen server.
    pub id: ServerId,

    /// Whether the caller's read preference was overridden to primary.
    pub must_use_primary: bool,
}

impl TopologyDescription {
    /// Picks one server for an operation, uniformly at random among the suitable ones.
    ///
    /// Returns `Ok(None)` when nothing is currently suitable. Fails immediately if any server's
    /// wire version range is incompatible with this crate, or if the read preference is invalid
    /// for the topology.
    pub fn select<R: Rng + ?Sized>(
        &self,
        operation_type: OperationType,
        read_preference: &ReadPreference,
        rng: &mut R,
    ) -> Result<Option<SelectedServer>> {
        if let Some(message) = self.compatibility_error() {
            return Err(ErrorKind::IncompatibleServer {
                message: message.to_string(),
            }
            .into());
        }

        if self.topology_type == TopologyType::Single {
            let Some(server) = self.servers.values().next() else {
                return Ok(None);
            };

            // The single server may be part of a replica set we cannot see.
            let must_use_primary = operation_type == OperationType::AggregateWithWrite
                && server.server_type != ServerType::Unknown
                && server.max_wire_version().unwrap_or(0)
                    < AGGREGATE_WITH_WRITE_ON_SECONDARY_WIRE_VERSION;

            if !server.has_hello_response() {
                tracing::trace!(server = %server.address, "single server is down");
                return Ok(None);
            }
            return Ok(Some(SelectedServer {
                id: server.id,
                must_use_primary,
            }));
        }

        let must_use_primary = self.must_use_primary(operation_type, read_preference);
        let suitable = self.suitable_servers(operation_type, read_preference)?;
        if suitable.is_empty() {
            return Ok(None);
        }

        let selected = suitable[rng.random_range(0..suitable.len())];
        tracing::trace!(
            topology_type = %self.topology_type,
            server = %selected.address,
            server_type = ?selected.server_type,
            "selected server"
        );

        Ok(Some(SelectedServer {
            id: selected.id,
            must_use_primary,
        }))
    }

    /// Every server that is eligible for the operation and within the latency window of the
    /// fastest eligible one.
    pub fn suitable_servers(
        &self,
        operation_type: OperationType,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        static PRIMARY: ReadPreference = ReadPreference::PRIMARY;
        let read_preference = if self.must_use_primary(operation_type, read_preference) {
            &PRIMARY
        } else {
            read_preference
        };

        let servers = match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single => self
                .servers
                .values()
                .filter(|server| server.server_type == ServerType::Standalone)
                .collect(),
            TopologyType::LoadBalanced => self.servers.values().collect(),
            TopologyType::Sharded => {
                let mut mongoses = self.servers_with_type(&[ServerType::Mongos]).collect();
                self.retain_servers_within_latency_window(&mut mongoses);
                mongoses
            }
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {
                match operation_type {
                    OperationType::Write => match self.topology_type {
                        TopologyType::ReplicaSetWithPrimary => self.primary().into_iter().collect(),
                        _ => Vec::new(),
                    },
                    OperationType::Read | OperationType::AggregateWithWrite => {
                        self.suitable_servers_in_replica_set(read_preference)?
                    }
                }
            }
        };

        Ok(servers)
    }

    /// Whether an aggregate with a write stage has to ignore a non-primary read preference
    /// because some known server is too old to run it on a secondary.
    pub(crate) fn must_use_primary(
        &self,
        operation_type: OperationType,
        read_preference: &ReadPreference,
    ) -> bool {
        if operation_type != OperationType::AggregateWithWrite
            || read_preference.is_primary()
        {
            return false;
        }

        self.servers.values().any(|server| {
            server.server_type != ServerType::Unknown
                && server.max_wire_version().unwrap_or(0)
                    < AGGREGATE_WITH_WRITE_ON_SECONDARY_WIRE_VERSION
        })
    }

    /// A description of why each server is unusable, for server selection error messages.
    pub(crate) fn server_errors(&self) -> String {
        let mut message = String::new();
        for server in self.servers.values() {
            if let Some(error) = server.error() {
                message.push_str(&format!(
                    " [{error} calling hello on '{}']",
                    server.address
                ));
            }
        }
        message
    }

    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(|server| server.is_available())
    }

    pub(crate) fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |server| types.contains(&server.server_type))
    }

    /// The current primary, if any.
    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers_with_type(&[ServerType::RsPrimary]).next()
    }

    fn retain_servers_within_latency_window(&self, suitable_servers: &mut Vec<&ServerDescription>) {
        let shortest_average_rtt = suitable_servers
            .iter()
            .filter_map(|server_desc| server_desc.average_round_trip_time)
            .min();

        let Some(shortest_average_rtt) = shortest_average_rtt else {
            suitable_servers.retain(|server| server.server_type == ServerType::LoadBalancer);
            return;
        };

        let max_rtt_within_window = shortest_average_rtt
            .checked_add(self.local_threshold)
            .unwrap_or(Duration::MAX);

        suitable_servers.retain(move |server_desc| match server_desc.average_round_trip_time {
            Some(server_rtt) => server_rtt <= max_rtt_within_window,
            // Load balancers are never checked, so they have no round trip time.
            None => server_desc.server_type == ServerType::LoadBalancer,
        });
    }

    fn suitable_servers_in_replica_set(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let tag_sets = read_preference.tag_sets();
        let max_staleness = read_preference.max_staleness();

        let servers = match read_preference.mode() {
            ReadMode::Primary => self.primary().into_iter().collect(),
            ReadMode::Secondary => self.suitable_servers_for_read_preference(
                &[ServerType::RsSecondary],
                tag_sets,
                max_staleness,
            )?,
            ReadMode::PrimaryPreferred => match self.primary() {
                Some(primary) => vec![primary],
                None => self.suitable_servers_for_read_preference(
                    &[ServerType::RsSecondary],
                    tag_sets,
                    max_staleness,
                )?,
            },
            ReadMode::SecondaryPreferred => {
                let suitable_servers = self.suitable_servers_for_read_preference(
                    &[ServerType::RsSecondary],
                    tag_sets,
                    max_staleness,
                )?;

                if suitable_servers.is_empty() {
                    self.primary().into_iter().collect()
                } else {
                    suitable_servers
                }
            }
            ReadMode::Nearest => self.suitable_servers_for_read_preference(
                &[ServerType::RsPrimary, ServerType::RsSecondary],
                tag_sets,
                max_staleness,
            )?,
        };

        Ok(servers)
    }

    fn suitable_servers_for_read_preference(
        &self,
        types: &'static [ServerType],
        tag_sets: &[TagSet],
        max_staleness: Option<Duration>,
    ) -> Result<Vec<&ServerDescription>> {
        let mut servers = self.servers_with_type(types).collect();

        if let Some(max_staleness) = max_staleness.filter(|staleness| !staleness.is_zero()) {
            verify_max_staleness(max_staleness, self.heartbeat_freq)?;
            self.filter_servers_by_max_staleness(&mut servers, max_staleness);
        }

        filter_servers_by_tag_sets(&mut servers, tag_sets);

        self.retain_servers_within_latency_window(&mut servers);

        Ok(servers)
    }

    fn filter_servers_by_max_staleness(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let max_staleness_ms = max_staleness.as_millis().try_into().unwrap_or(i64::MAX);

        match self.primary() {
            Some(primary) => servers.retain(|server| {
                self.secondary_staleness_with_primary(server, primary)
                    .is_some_and(|staleness| staleness <= max_staleness_ms)
            }),
            None => {
                let Some(max_write_date) = self
                    .servers_with_type(&[ServerType::RsSecondary])
                    .filter_map(|server| server.last_write_date())
                    .map(|date| date.timestamp_millis())
                    .max()
                else {
                    return;
                };

                servers.retain(|server| {
                    self.secondary_staleness_without_primary(server, max_write_date)
                        .is_some_and(|staleness| staleness <= max_staleness_ms)
                })
            }
        }
    }

    fn heartbeat_frequency_ms(&self) -> i64 {
        self.heartbeat_freq
            .as_millis()
            .try_into()
            .unwrap_or(i64::MAX)
    }

    fn secondary_staleness_with_primary(
        &self,
        secondary: &ServerDescription,
        primary: &ServerDescription,
    ) -> Option<i64> {
        let primary_last_update = primary.last_update_time?.timestamp_millis();
        let primary_last_write = primary.last_write_date()?.timestamp_millis();

        let secondary_last_update = secondary.last_update_time?.timestamp_millis();
        let secondary_last_write = secondary.last_write_date()?.timestamp_millis();

        Some(
            (secondary_last_update - secondary_last_write)
                - (primary_last_update - primary_last_write)
                + self.heartbeat_frequency_ms(),
        )
    }

    fn secondary_staleness_without_primary(
        &self,
        secondary: &ServerDescription,
        max_last_write_date: i64,
    ) -> Option<i64> {
        let secondary_last_write = secondary.last_write_date()?.timestamp_millis();
        Some(max_last_write_date - secondary_last_write + self.heartbeat_frequency_ms())
    }
}

/// Rejects a max staleness below both 90 seconds and the heartbeat frequency plus the servers'
/// idle write period.
pub(crate) fn verify_max_staleness(
    max_staleness: Duration,
    heartbeat_frequency: Duration,
) -> Result<()> {
    let smallest_max_staleness = std::cmp::max(
        SMALLEST_MAX_STALENESS,
        heartbeat_frequency
            .checked_add(IDLE_WRITE_PERIOD)
            .unwrap_or(Duration::MAX),
    );

    if max_staleness < smallest_max_staleness {
        return Err(Error::invalid_argument(format!(
            "invalid max_staleness value: must be at least {} seconds",
            smallest_max_staleness.as_secs()
        )));
    }

    Ok(())
}

fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matches_tag_set = |server: &&ServerDescription| server.matches_tag_set(tag_set);

        if servers.iter().any(matches_tag_set) {
            servers.retain(matches_tag_set);

            return;
        }
    }

    servers.clear();
}
