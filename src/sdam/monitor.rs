use std::time::{Duration, Instant};

use tokio::sync::watch;

use super::{
    topology::{Topology, WeakTopology},
    ServerDescription,
    MIN_HEARTBEAT_FREQUENCY,
};
use crate::{
    cmap::Connection,
    error::Result,
    hello::{hello_command, run_hello, HelloReply},
    options::ServerAddress,
    runtime,
};

/// The weight given to the latest round-trip-time measurement in the exponentially-smoothed
/// average.
const RTT_SMOOTHING_FACTOR: f64 = 0.2;

/// Monitor that performs regular heartbeats against a single server to determine its status.
pub(crate) struct Monitor {
    address: ServerAddress,

    /// The dedicated monitoring connection. Failures on this connection never churn the
    /// application pool; the connection is simply re-established on the next check.
    connection: Option<Connection>,

    topology: WeakTopology,

    check_request_rx: watch::Receiver<u32>,

    average_round_trip_time: Option<Duration>,

    heartbeat_frequency: Duration,
}

impl Monitor {
    /// Starts a monitor task for the given address.
    pub(crate) fn start(address: ServerAddress, topology: &Topology) {
        let monitor = Self {
            address,
            connection: None,
            check_request_rx: topology.subscribe_to_check_requests(),
            heartbeat_frequency: topology.options().heartbeat_frequency(),
            topology: topology.downgrade(),
            average_round_trip_time: None,
        };
        runtime::spawn(monitor.execute());
    }

    async fn execute(mut self) {
        loop {
            let topology = match self.topology.upgrade() {
                Some(topology) => topology,
                None => break,
            };

            // The server may have been removed from the topology since the last check.
            if !topology.state().servers.contains_key(&self.address) {
                break;
            }

            self.check_server(&topology).await;
            drop(topology);

            // Never check the same server more often than the minimum frequency, and wait out
            // the rest of the heartbeat unless a check is requested.
            runtime::delay_for(MIN_HEARTBEAT_FREQUENCY).await;

            let remainder = self
                .heartbeat_frequency
                .saturating_sub(MIN_HEARTBEAT_FREQUENCY);
            let _ = runtime::timeout(remainder, self.check_request_rx.changed()).await;
        }
    }

    /// Checks the server by running a hello command, publishing the resulting description to
    /// the topology.
    async fn check_server(&mut self, topology: &Topology) {
        // Consume any pending check requests; this check satisfies them.
        self.check_request_rx.borrow_and_update();

        let check_result = match self.perform_hello(topology).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let previously_available = topology
                    .state()
                    .description
                    .get_server_description(&self.address)
                    .map(|sd| sd.is_available())
                    .unwrap_or(false);

                // A single network hiccup against a server that was just fine gets one
                // immediate retry on a fresh connection before the server is marked Unknown.
                if e.is_network_error() && previously_available {
                    topology
                        .handle_monitor_error(self.address.clone(), e)
                        .await;
                    self.perform_hello(topology).await
                } else {
                    Err(e)
                }
            }
        };

        match check_result {
            Ok(reply) => {
                let server_description = ServerDescription::new_from_hello_reply(
                    self.address.clone(),
                    reply,
                    self.average_round_trip_time
                        .unwrap_or(Duration::from_millis(0)),
                );
                topology.update(server_description).await;
            }
            Err(e) => {
                tracing::debug!(address = %self.address, error = %e, "server check failed");
                topology.handle_monitor_error(self.address.clone(), e).await;
            }
        }
    }

    async fn perform_hello(&mut self, topology: &Topology) -> Result<HelloReply> {
        let start = Instant::now();

        let result: Result<HelloReply> = match self.connection {
            Some(ref mut conn) => {
                let command = hello_command(Some(conn.stream_description()?.hello_ok));
                run_hello(conn, command).await
            }
            None => {
                match topology
                    .establisher()
                    .establish_monitoring_connection(self.address.clone())
                    .await
                {
                    Ok((connection, reply)) => {
                        self.connection = Some(connection);
                        Ok(reply)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok(reply) => {
                self.update_average_round_trip_time(start.elapsed());
                Ok(reply)
            }
            Err(e) => {
                self.connection.take();
                self.average_round_trip_time = None;
                Err(e)
            }
        }
    }

    /// Exponentially smooth the round trip time, so a single slow check does not evict a server
    /// from every latency window.
    fn update_average_round_trip_time(&mut self, sample: Duration) {
        self.average_round_trip_time = Some(match self.average_round_trip_time {
            Some(old_rtt) => Duration::from_secs_f64(
                RTT_SMOOTHING_FACTOR * sample.as_secs_f64()
                    + (1.0 - RTT_SMOOTHING_FACTOR) * old_rtt.as_secs_f64(),
            ),
            None => sample,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_smoothing() {
        let mut monitor_rtt: Option<Duration> = None;

        let mut update = |sample_ms: u64| {
            let sample = Duration::from_millis(sample_ms);
            monitor_rtt = Some(match monitor_rtt {
                Some(old) => Duration::from_secs_f64(
                    RTT_SMOOTHING_FACTOR * sample.as_secs_f64()
                        + (1.0 - RTT_SMOOTHING_FACTOR) * old.as_secs_f64(),
                ),
                None => sample,
            });
            monitor_rtt.unwrap()
        };

        assert_eq!(update(10), Duration::from_millis(10));
        let second = update(20);
        // 0.2 * 20ms + 0.8 * 10ms = 12ms
        approx::assert_relative_eq!(second.as_secs_f64(), 0.012, epsilon = 1e-9);
    }
}
