//! Connection liveness enforcement.
//!
//! Every tick: connections of users idle past the configured lifetime are
//! closed; everyone else gets a one-byte PING and a short grace window to
//! answer before the pong prune removes them. Both sleeps observe the
//! shutdown token so a stop wakes the loop promptly.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chat::ChatServer;
use crate::ws::CLOSE_INACTIVE_CONNECTION;

const TICK_INTERVAL: Duration = Duration::from_secs(60);
const PONG_GRACE: Duration = Duration::from_secs(2);

pub struct Watchdog {
    chat: Arc<ChatServer>,
    lifetime_seconds: i64,
    tick_interval: Duration,
    pong_grace: Duration,
}

impl Watchdog {
    pub fn new(chat: Arc<ChatServer>, lifetime_seconds: u64) -> Self {
        Self {
            chat,
            lifetime_seconds: lifetime_seconds as i64,
            tick_interval: TICK_INTERVAL,
            pong_grace: PONG_GRACE,
        }
    }

    #[cfg(test)]
    fn with_intervals(mut self, tick_interval: Duration, pong_grace: Duration) -> Self {
        self.tick_interval = tick_interval;
        self.pong_grace = pong_grace;
        self
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }

    async fn run(self, token: CancellationToken) {
        tracing::info!(
            lifetime_seconds = self.lifetime_seconds,
            "watchdog started"
        );
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.tick_interval) => {}
            }

            for connection in self.chat.storage().snapshot() {
                let inactive = self
                    .chat
                    .stats()
                    .user(connection.user_id())
                    .inactive_seconds();

                if inactive >= self.lifetime_seconds {
                    connection.send_close(
                        CLOSE_INACTIVE_CONNECTION,
                        format!(
                            "Inactive more than {} seconds ({})",
                            self.lifetime_seconds, inactive
                        ),
                    );
                    // the registry entry goes now; the actor's own close is
                    // idempotent against it
                    self.chat.storage().remove_connection(&connection);
                } else if connection.send_ping().is_ok() {
                    self.chat.storage().mark_pong_wait(&connection);
                } else {
                    self.chat.storage().remove_connection(&connection);
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.pong_grace) => {}
            }

            let disconnected = self.chat.storage().disconnect_without_pong();
            if disconnected > 0 {
                tracing::debug!(count = disconnected, "disconnected dangling connections");
            }
        }
        tracing::info!("watchdog stopped");
    }
}
