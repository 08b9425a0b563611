//! Connectivity supervision and automatic reconnection

use log::{debug, error, info, warn};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::Client;
use crate::error::Error;

impl Client {
    /// Keep the client connected until `cancel` fires or [`Client::close`] is
    /// called.
    ///
    /// Connects first if needed, then checks connectivity every
    /// `poll_interval`. When the connection drops and a backoff strategy is
    /// configured, reconnection is attempted. Cancelling `cancel` closes the
    /// client before returning.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let shutdown = self.fresh_shutdown_token();

        if !self.is_connected().await {
            match self.connect().await {
                Ok(()) | Err(Error::AlreadyConnected) => {}
                Err(e) if self.backoff.is_some() => {
                    warn!("Initial connection failed: {}", e);
                    self.reconnect(&cancel, &shutdown).await;
                }
                Err(e) => return Err(e),
            }
        }

        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut was_connected = self.is_connected().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Run cancelled, closing client");
                    return self.close().await;
                }
                _ = shutdown.cancelled() => {
                    debug!("Client closed, leaving run loop");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let connected = self.is_connected().await;
            if was_connected && !connected {
                warn!("Connection to server lost");
                if self.backoff.is_some() {
                    self.reconnect(&cancel, &shutdown).await;
                }
            }
            was_connected = self.is_connected().await;
        }
    }

    /// Run the backoff schedule until a connect succeeds, attempts run out,
    /// or either token fires. Returns whether the client ended up connected.
    pub(crate) async fn reconnect(
        &self,
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> bool {
        let Some(backoff) = self.backoff.clone() else {
            return false;
        };

        let max_attempts = backoff.max_attempts();
        for attempt in 1..=max_attempts {
            let delay = backoff.next_delay(attempt);
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay, attempt, max_attempts
            );

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.connect().await {
                Ok(()) => {
                    info!("Reconnected on attempt {}", attempt);
                    return true;
                }
                Err(Error::AlreadyConnected) => return true,
                Err(e) => warn!("Reconnection attempt {} failed: {}", attempt, e),
            }
        }

        error!(
            "Giving up after {} reconnection attempts, client stays disconnected",
            max_attempts
        );
        false
    }
}
