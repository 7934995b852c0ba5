// Pulls an image from any byte stream into the OTA manager in bounded chunks
use embedded_io::Read;
use std::time::Duration;

use super::manager::{OtaManager, SessionId};
use super::session::FinishReport;
use crate::config::OtaConfig;
use crate::error::{OtaError, OtaResult};
use crate::flash::FlashBackend;
use crate::partition::{Bank, BootConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub chunk_size: usize,
    /// Yield after this many chunks so other tasks get the CPU
    pub yield_every: u32,
    pub yield_for: Duration,
}

impl ReceiveOptions {
    pub fn from_config(config: &OtaConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            yield_every: config.yield_every,
            yield_for: Duration::from_millis(config.yield_ms),
        }
    }
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self::from_config(&OtaConfig::default())
    }
}

/// Open a session and stream `declared_length` bytes from `source` into it
pub fn receive_update<B, C, R>(
    manager: &mut OtaManager<B, C>,
    source: &mut R,
    declared_length: u32,
    target_hint: Option<Bank>,
    options: &ReceiveOptions,
) -> OtaResult<FinishReport>
where
    B: FlashBackend,
    C: BootConfig,
    R: Read,
{
    let id = manager.begin_update(declared_length, target_hint)?;
    receive_into(manager, id, source, options)
}

/// Drive an already open session to completion
pub fn receive_into<B, C, R>(
    manager: &mut OtaManager<B, C>,
    id: SessionId,
    source: &mut R,
    options: &ReceiveOptions,
) -> OtaResult<FinishReport>
where
    B: FlashBackend,
    C: BootConfig,
    R: Read,
{
    receive_with_yield(manager, id, source, options, std::thread::sleep)
}

/// Like [`receive_into`] with a caller-chosen yield, e.g. a no-op in tests
pub fn receive_with_yield<B, C, R, Y>(
    manager: &mut OtaManager<B, C>,
    id: SessionId,
    source: &mut R,
    options: &ReceiveOptions,
    mut yield_now: Y,
) -> OtaResult<FinishReport>
where
    B: FlashBackend,
    C: BootConfig,
    R: Read,
    Y: FnMut(Duration),
{
    let status = manager.status();
    if status.session != Some(id) {
        return Err(OtaError::SessionNotFound(id));
    }
    let declared = status.declared_length;
    let mut buffer = vec![0u8; options.chunk_size.max(1)];
    // picks up where earlier `feed` calls left the session
    let mut received = status.bytes_written;
    let mut chunks: u32 = 0;
    let mut next_report = (u64::from(received) * 10 / u64::from(declared.max(1))) as u32 * 10 + 10;
    let yield_every = options.yield_every.max(1);

    while received < declared {
        let want = buffer.len().min((declared - received) as usize);
        let n = match source.read(&mut buffer[..want]) {
            Ok(0) => {
                log::error!("OTA stream closed after {} of {} bytes", received, declared);
                return Err(manager.fail(id, OtaError::IncompleteData { received, expected: declared }));
            }
            Ok(n) => n,
            Err(e) => {
                log::error!("OTA transport read failed after {} bytes: {:?}", received, e);
                return Err(manager.fail(id, OtaError::TransportReadError { received, expected: declared }));
            }
        };

        let used = manager.feed(id, &buffer[..n])?;
        received += used as u32;
        chunks += 1;

        let percent = (u64::from(received) * 100 / u64::from(declared)) as u32;
        if percent >= next_report {
            log::info!("OTA progress: {}% ({}/{} bytes)", percent, received, declared);
            next_report = (percent / 10 + 1) * 10;
        }
        if chunks % yield_every == 0 {
            yield_now(options.yield_for);
        }
    }

    manager.finish(id)
}
