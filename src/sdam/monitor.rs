use std::time::{Duration, Instant};

use super::{
    description::server::ServerId,
    topology::{Topology, TopologyUpdateRequestReceiver, WeakTopology},
};
use crate::{
    conn::Connection,
    error::Result,
    hello::{hello_command, HelloReply},
    options::ServerAddress,
    runtime::{self, AsyncJoinHandle},
};

/// Monitor that performs regular heartbeats to determine server status.
pub(crate) struct Monitor {
    id: ServerId,
    address: ServerAddress,
    connection: Option<Connection>,

    /// Whether the server accepted `hello` in its last handshake. Unknown until the first one.
    hello_ok: Option<bool>,

    topology: WeakTopology,
    update_requests: TopologyUpdateRequestReceiver,
}

impl Monitor {
    /// Spawns the heartbeat task for one server. A weak reference is used so that the monitor
    /// doesn't keep the topology alive after every handle to it has been dropped.
    pub(super) fn start(
        id: ServerId,
        address: ServerAddress,
        topology: WeakTopology,
        update_requests: TopologyUpdateRequestReceiver,
    ) -> AsyncJoinHandle<()> {
        let monitor = Self {
            id,
            address,
            connection: None,
            hello_ok: None,
            topology,
            update_requests,
        };
        runtime::spawn(monitor.execute())
    }

    async fn execute(mut self) {
        tracing::debug!(server = %self.address, server_id = %self.id, "monitor started");

        loop {
            let Some(topology) = self.topology.upgrade() else {
                break;
            };
            if topology.is_shut_down() || topology.server_description(self.id).is_none() {
                break;
            }

            let heartbeat_freq = topology.options().heartbeat_freq();
            let min_heartbeat_freq = topology.options().min_heartbeat_freq();

            self.check_server(&topology).await;

            // Drop the strong reference before going back to sleep in case the topology is
            // dropped in between checks.
            drop(topology);

            tokio::time::sleep(min_heartbeat_freq).await;
            self.update_requests
                .wait_for_update_request(heartbeat_freq.saturating_sub(min_heartbeat_freq))
                .await;
            self.update_requests.clear_update_requests();
        }

        tracing::debug!(server = %self.address, server_id = %self.id, "monitor stopped");
    }

    /// Checks the server by running a hello. A network error against a server that was
    /// previously available is retried once on a new connection right away, since the old
    /// connection may simply have been closed by the server.
    async fn check_server(&mut self, topology: &Topology) {
        let previously_available = topology
            .server_description(self.id)
            .is_some_and(|server| server.is_available());

        let result = match self.perform_hello(topology).await {
            Err(error) if error.is_network_error() && previously_available => {
                tracing::debug!(
                    server = %self.address,
                    error = %error,
                    "heartbeat failed, retrying"
                );
                topology.handle_monitor_error(self.id, error).await;
                self.perform_hello(topology).await
            }
            result => result,
        };

        match result {
            Ok((reply, round_trip_time)) => {
                tracing::trace!(
                    server = %self.address,
                    round_trip_time = ?round_trip_time,
                    "heartbeat succeeded"
                );
                topology
                    .handle_hello(self.id, Ok(reply), Some(round_trip_time))
                    .await;
            }
            Err(error) => {
                tracing::debug!(server = %self.address, error = %error, "heartbeat failed");
                topology.handle_monitor_error(self.id, error).await;
            }
        }
    }

    async fn perform_hello(&mut self, topology: &Topology) -> Result<(HelloReply, Duration)> {
        let result = match self.connection {
            Some(ref mut conn) => {
                let command = hello_command(false, self.hello_ok);
                let start = Instant::now();
                let response = match conn.stream_description() {
                    Ok(description) => {
                        let protocol = description.wire_protocol();
                        conn.send_command(&command, protocol).await
                    }
                    Err(error) => Err(error),
                };
                let round_trip_time = start.elapsed();
                response.and_then(|response| {
                    HelloReply::parse(self.address.clone(), response.into_document())
                        .map(|reply| (reply, round_trip_time))
                })
            }
            None => {
                match topology
                    .establisher()
                    .establish_monitoring_connection(self.address.clone())
                    .await
                {
                    Ok((connection, handshake)) => {
                        self.hello_ok =
                            Some(handshake.hello_reply.command_response.hello_ok == Some(true));
                        self.connection = Some(connection);
                        Ok((handshake.hello_reply, handshake.round_trip_time))
                    }
                    Err(error) => Err(error),
                }
            }
        };

        if result.is_err() {
            self.connection.take();
        }

        result
    }
}
