//! The orchestration loop.
//!
//! Pulls datagrams from a [`DatagramSource`], archives and buffers them per
//! channel, and turns every buffer whose averaging window has elapsed into one
//! summary line on the [`Transport`]. Buffers are checked after each datagram and
//! on a fixed tick, so quiet channels still flush on time.

use crate::config::{ChannelConfig, GatewayConfig};
use crate::data::buffer::ChannelBuffer;
use crate::data::datagram::parse_datagram;
use crate::data::stats::generate_message;
use crate::data::storage::DatasetSink;
use crate::network::DatagramSource;
use crate::transport::{stop_requested, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Routes datagrams into channel buffers and flushes them onto a transport.
pub struct Gateway {
    buffers: Vec<ChannelBuffer>,
    index: HashMap<String, usize>,
    transport: Arc<dyn Transport>,
    sink: Box<dyn DatasetSink>,
    flush_interval: Duration,
}

impl Gateway {
    /// One buffer per configured channel; windows start now.
    pub fn new(
        channels: &[ChannelConfig],
        transport: Arc<dyn Transport>,
        sink: Box<dyn DatasetSink>,
        flush_interval: Duration,
    ) -> Self {
        let buffers: Vec<ChannelBuffer> = channels
            .iter()
            .map(|c| ChannelBuffer::new(c.id.clone(), c.averaging_window))
            .collect();
        let index = buffers
            .iter()
            .enumerate()
            .map(|(i, b)| (b.channel_id().to_string(), i))
            .collect();

        Self {
            buffers,
            index,
            transport,
            sink,
            flush_interval,
        }
    }

    /// Gateway for the `[[channels]]` and `[gateway]` sections.
    pub fn from_config(
        config: &GatewayConfig,
        transport: Arc<dyn Transport>,
        sink: Box<dyn DatasetSink>,
    ) -> Self {
        Self::new(
            &config.channels,
            transport,
            sink,
            config.gateway.flush_interval,
        )
    }

    /// Buffer of `channel_id`, if configured.
    pub fn buffer(&self, channel_id: &str) -> Option<&ChannelBuffer> {
        self.index.get(channel_id).map(|&i| &self.buffers[i])
    }

    /// Parse, archive and buffer one datagram.
    ///
    /// Returns whether the datagram reached a buffer. Malformed datagrams and
    /// unknown channels are logged and dropped; archival failures are logged and
    /// do not prevent buffering.
    pub async fn handle_datagram(&mut self, text: &str) -> bool {
        let datagram = match parse_datagram(text) {
            Ok(datagram) => datagram,
            Err(e) => {
                error!(error = %e, "Dropping datagram");
                return false;
            }
        };

        if let Err(e) = self
            .sink
            .insert(&datagram.channel_id, datagram.timestamp, &datagram.values)
            .await
        {
            error!(channel = %datagram.channel_id, error = %e, "Failed to archive dataset");
        }

        match self.index.get(&datagram.channel_id) {
            Some(&i) => {
                self.buffers[i].add(datagram.timestamp, &datagram.values);
                true
            }
            None => {
                warn!(channel = %datagram.channel_id, "No buffer for channel, dropping datagram");
                false
            }
        }
    }

    /// Flush every ready buffer onto the transport. Returns the number of messages
    /// enqueued.
    pub fn flush_ready(&self) -> usize {
        let mut sent = 0;
        for buffer in self.buffers.iter().filter(|b| b.ready()) {
            let samples = buffer.fetch_and_clear();
            if let Some(message) = generate_message(buffer.channel_id(), &samples) {
                debug!(channel = %buffer.channel_id(), message = %message.trim_end());
                self.transport.enqueue(message);
                sent += 1;
            }
        }
        sent
    }

    /// Run until `shutdown` is set or its sender is dropped.
    ///
    /// The archive sink is shut down on exit. The transport is left to its owner.
    pub async fn run(
        &mut self,
        source: &mut dyn DatagramSource,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            channels = self.buffers.len(),
            transport = self.transport.name(),
            "Gateway loop started"
        );

        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !stop_requested(&shutdown) {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.flush_ready();
                }
                datagram = source.read() => {
                    if let Some(text) = datagram {
                        self.handle_datagram(&text).await;
                        self.flush_ready();
                    }
                }
            }
        }

        if let Err(e) = self.sink.shutdown().await {
            error!(error = %e, "Failed to close archive");
        }
        info!("Gateway loop stopped");
    }
}
