use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use sdiohtc_bus::{
    map_service_to_pipe, BusQueue, MailboxMap, QueueStats, RawBus, RequestFlags, Transfer,
};

use crate::callbacks::HostCallbacks;
use crate::config::DeviceConfig;
use crate::error::Result;
use crate::registers::{IrqEnable, IrqSnapshot, HOST_INT_STATUS_ADDRESS, INT_STATUS_ENABLE_ADDRESS, SNAPSHOT_LEN};

/// Polls of the status block made by [`Device::wait_for_pending_recv`].
pub const PENDING_RECV_POLLS: usize = 10;

/// Per-device counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub rx_messages: u64,
    pub rx_bundles: u64,
    pub rx_single_fetches: u64,
    pub rx_aborted_passes: u64,
    pub rx_buffer_waits: u64,
    pub tx_submitted: u64,
    pub tx_completed: u64,
    pub tx_failed: u64,
    pub fatal_events: u64,
    pub bus: QueueStats,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub rx_messages: AtomicU64,
    pub rx_bundles: AtomicU64,
    pub rx_single_fetches: AtomicU64,
    pub rx_aborted_passes: AtomicU64,
    pub rx_buffer_waits: AtomicU64,
    pub tx_submitted: AtomicU64,
    pub tx_completed: AtomicU64,
    pub tx_failed: AtomicU64,
    pub fatal_events: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State of the interrupt service routine between passes.
#[derive(Debug, Default)]
pub(crate) struct DsrState {
    /// Receive passes run by the current DSR invocation.
    pub recv_count: u32,
    /// Status re-reads still allowed in the current DSR invocation.
    pub recheck: u32,
}

/// One attached target.
pub struct Device {
    pub(crate) config: DeviceConfig,
    pub(crate) bus: BusQueue,
    pub(crate) callbacks: Arc<dyn HostCallbacks>,
    pub(crate) irq_enable: Mutex<IrqEnable>,
    pub(crate) dsr: Mutex<DsrState>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) bundling: AtomicBool,
    /// The last receive pass ran out of buffers. Kept outside `dsr` so
    /// callbacks running under the DSR can read it.
    pub(crate) waiting_for_buffers: AtomicBool,
}

impl Device {
    /// Validate `config`, start the bus worker and attach to the target.
    ///
    /// Interrupts stay masked until [`start`](Self::start).
    pub fn attach<B: RawBus>(
        bus: B,
        config: DeviceConfig,
        callbacks: Arc<dyn HostCallbacks>,
    ) -> Result<Self> {
        config.validate()?;
        let map = MailboxMap::new(&config.mailbox, config.block_size)?;
        let bus = BusQueue::start(bus, map, config.max_bus_requests)?;
        info!(
            block_size = config.block_size,
            bundling = config.bundle.enabled,
            "device attached"
        );
        Ok(Self {
            bundling: AtomicBool::new(config.bundle.enabled),
            waiting_for_buffers: AtomicBool::new(false),
            config,
            bus,
            callbacks,
            irq_enable: Mutex::new(IrqEnable::masked()),
            dsr: Mutex::new(DsrState::default()),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn mailbox_map(&self) -> &MailboxMap {
        self.bus.mailbox_map()
    }

    /// Unmask the interrupts the transport services.
    pub fn start(&self) -> Result<()> {
        self.write_irq_enable(IrqEnable::unmasked())?;
        debug!("interrupts unmasked");
        Ok(())
    }

    /// Mask every target interrupt.
    pub fn stop(&self) -> Result<()> {
        self.write_irq_enable(IrqEnable::masked())?;
        debug!("interrupts masked");
        Ok(())
    }

    /// Mask interrupts and stop the bus worker.
    pub fn detach(self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "failed to mask interrupts on detach");
        }
        self.bus.shutdown();
        info!("device detached");
    }

    /// Current value of the interrupt enable shadow.
    pub fn irq_enable(&self) -> IrqEnable {
        *lock(&self.irq_enable)
    }

    /// Whether receive bundling is enabled.
    pub fn bundling_enabled(&self) -> bool {
        self.bundling.load(Ordering::Relaxed)
    }

    /// Turn receive bundling on or off at runtime.
    pub fn set_bundling(&self, enabled: bool) {
        self.bundling.store(enabled, Ordering::Relaxed);
    }

    /// `(uplink, downlink)` pipes for an HTC service.
    pub fn map_service_to_pipe(&self, service_id: u16) -> Option<(u8, u8)> {
        map_service_to_pipe(service_id, self.config.mailbox_swap)
    }

    /// Whether the last receive pass stopped for lack of buffers.
    pub fn waiting_for_buffers(&self) -> bool {
        self.waiting_for_buffers.load(Ordering::Relaxed)
    }

    /// Poll until mailbox 0 has no pending data, up to
    /// [`PENDING_RECV_POLLS`] reads. Returns true if it drained.
    pub fn wait_for_pending_recv(&self, interval: Duration) -> Result<bool> {
        for _ in 0..PENDING_RECV_POLLS {
            let snapshot = self.read_snapshot()?;
            if snapshot.host_int_status & 0x01 == 0 {
                return Ok(true);
            }
            thread::sleep(interval);
        }
        Ok(false)
    }

    pub fn stats(&self) -> DeviceStats {
        let c = &self.counters;
        DeviceStats {
            rx_messages: c.rx_messages.load(Ordering::Relaxed),
            rx_bundles: c.rx_bundles.load(Ordering::Relaxed),
            rx_single_fetches: c.rx_single_fetches.load(Ordering::Relaxed),
            rx_aborted_passes: c.rx_aborted_passes.load(Ordering::Relaxed),
            rx_buffer_waits: c.rx_buffer_waits.load(Ordering::Relaxed),
            tx_submitted: c.tx_submitted.load(Ordering::Relaxed),
            tx_completed: c.tx_completed.load(Ordering::Relaxed),
            tx_failed: c.tx_failed.load(Ordering::Relaxed),
            fatal_events: c.fatal_events.load(Ordering::Relaxed),
            bus: self.bus.stats(),
        }
    }

    pub(crate) fn read_snapshot(&self) -> Result<IrqSnapshot> {
        let raw = self.bus.submit_sync(Transfer::read(
            HOST_INT_STATUS_ADDRESS,
            SNAPSHOT_LEN,
            RequestFlags::READ_SYNC_BYTE_INC,
        ))?;
        Ok(IrqSnapshot::parse(&raw))
    }

    fn write_irq_enable(&self, value: IrqEnable) -> Result<()> {
        // Held across the write so the shadow always matches the hardware.
        let mut shadow = lock(&self.irq_enable);
        self.bus.submit_sync(Transfer::write(
            INT_STATUS_ENABLE_ADDRESS,
            &value.to_bytes(),
            RequestFlags::WRITE_SYNC_BYTE_INC,
        ))?;
        *shadow = value;
        Ok(())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("irq_enable", &self.irq_enable())
            .field("bundling", &self.bundling_enabled())
            .finish_non_exhaustive()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
