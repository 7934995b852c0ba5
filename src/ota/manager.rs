// OTA Manager - owns the flash, the boot configuration and at most one session

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::image::ImageFormat;
use super::session::{FinishReport, OtaSession, SessionState};
use crate::config::OtaConfig;
use crate::error::{OtaError, OtaResult};
use crate::flash::{FlashBackend, SharedFlash};
use crate::partition::{Bank, BootConfig, PartitionLayout, PartitionSelector};

pub type SessionId = u32;

/// Cancels the running session from another thread. Takes effect at the
/// next `feed`/`finish` call.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub state: SessionState,
    pub bytes_written: u32,
    pub declared_length: u32,
    pub session: Option<SessionId>,
    pub format: Option<ImageFormat>,
    pub target_bank: Option<Bank>,
    pub last_error: Option<&'static str>,
    pub progress: u8,
}

impl StatusSnapshot {
    fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            bytes_written: 0,
            declared_length: 0,
            session: None,
            format: None,
            target_bank: None,
            last_error: None,
            progress: 0,
        }
    }

    fn of<B: FlashBackend>(id: SessionId, session: &OtaSession<B>) -> Self {
        let declared = session.declared();
        let received = session.received();
        let progress = if session.state() == SessionState::Committed {
            100
        } else if declared > 0 {
            (u64::from(received) * 100 / u64::from(declared)) as u8
        } else {
            0
        };
        Self {
            state: session.state(),
            bytes_written: received,
            declared_length: declared,
            session: Some(id),
            format: session.format(),
            target_bank: session.target().bank,
            last_error: session.last_error().map(OtaError::code),
            progress,
        }
    }
}

pub struct OtaManager<B, C> {
    flash: SharedFlash<B>,
    boot: C,
    config: OtaConfig,
    session: Option<(SessionId, OtaSession<B>)>,
    next_id: SessionId,
    last: Option<StatusSnapshot>,
    abort: AbortHandle,
}

impl<B: FlashBackend, C: BootConfig> OtaManager<B, C> {
    pub fn new(flash: SharedFlash<B>, boot: C, config: OtaConfig) -> OtaResult<Self> {
        let geometry = flash
            .geometry()
            .map_err(|source| OtaError::FlashReadFailure { address: 0, source })?;
        let layout = boot.layout()?;
        layout.validate(&geometry)?;
        log::info!(
            "OTA manager ready: {} KiB flash, running region 0x{:08x}",
            geometry.size / 1024,
            layout.running_region().start()
        );
        Ok(Self {
            flash,
            boot,
            config,
            session: None,
            next_id: 1,
            last: None,
            abort: AbortHandle::default(),
        })
    }

    pub fn begin_update(&mut self, declared_length: u32, target_hint: Option<Bank>) -> OtaResult<SessionId> {
        if self.session.is_some() {
            log::warn!("OTA begin rejected: a session is already active");
            return Err(OtaError::SessionAlreadyActive);
        }
        if declared_length == 0 {
            return Err(self.reject(OtaError::HeaderInvalid("declared length is zero")));
        }

        let geometry = self
            .flash
            .geometry()
            .map_err(|source| OtaError::FlashReadFailure { address: 0, source })?;
        let layout = self.boot.layout()?;
        let target = match PartitionSelector::select(&layout, &geometry, declared_length, target_hint) {
            Ok(target) => target,
            Err(e) => return Err(self.reject(e)),
        };

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.abort.reset();

        log::info!(
            "OTA session {} started: {} bytes into 0x{:08x} (bank {:?})",
            id,
            declared_length,
            target.region.start(),
            target.bank
        );
        let mut session = OtaSession::new(self.flash.clone(), target, declared_length, &self.config);
        if let Err(e) = session.start() {
            self.last = Some(StatusSnapshot::of(id, &session));
            return Err(e);
        }
        self.session = Some((id, session));
        Ok(id)
    }

    pub fn feed(&mut self, id: SessionId, bytes: &[u8]) -> OtaResult<usize> {
        self.check_abort(id)?;
        let result = self.session_mut(id)?.feed(bytes);
        self.retire_if_terminal();
        result
    }

    pub fn finish(&mut self, id: SessionId) -> OtaResult<FinishReport> {
        self.check_abort(id)?;
        // borrow the session and the boot config as separate fields
        let session = match self.session.as_mut() {
            Some((current, session)) if *current == id => session,
            _ => return Err(OtaError::SessionNotFound(id)),
        };
        let result = session.finish(&mut self.boot);
        self.retire_if_terminal();
        result
    }

    /// Cancel a session; unknown or finished ids are ignored
    pub fn abort(&mut self, id: SessionId) {
        if let Ok(session) = self.session_mut(id) {
            session.abort("aborted by request");
        }
        self.retire_if_terminal();
    }

    /// Fail the session with an error raised outside the engine, e.g. by
    /// the transport. Returns the error for propagation.
    pub fn fail(&mut self, id: SessionId, err: OtaError) -> OtaError {
        let err = match self.session_mut(id) {
            Ok(session) => session.fail(err),
            Err(_) => err,
        };
        self.retire_if_terminal();
        err
    }

    pub fn status(&self) -> StatusSnapshot {
        match &self.session {
            Some((id, session)) => StatusSnapshot::of(*id, session),
            None => self.last.clone().unwrap_or_else(StatusSnapshot::idle),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Raw flash contents for diagnostics. Refused while a session runs.
    pub fn read_flash(&self, address: u32, len: usize) -> OtaResult<Vec<u8>> {
        if self.session.is_some() {
            return Err(OtaError::SessionAlreadyActive);
        }
        let mut buffer = vec![0u8; len];
        self.flash
            .read(address, &mut buffer)
            .map_err(|source| OtaError::FlashReadFailure { address, source })?;
        Ok(buffer)
    }

    pub fn layout(&self) -> OtaResult<PartitionLayout> {
        self.boot.layout()
    }

    pub fn config(&self) -> &OtaConfig {
        &self.config
    }

    /// Applies to the next session
    pub fn set_config(&mut self, config: OtaConfig) {
        self.config = config;
    }

    pub fn boot_config(&self) -> &C {
        &self.boot
    }

    pub fn boot_config_mut(&mut self) -> &mut C {
        &mut self.boot
    }

    pub fn flash(&self) -> &SharedFlash<B> {
        &self.flash
    }

    fn session_mut(&mut self, id: SessionId) -> OtaResult<&mut OtaSession<B>> {
        match self.session.as_mut() {
            Some((current, session)) if *current == id => Ok(session),
            _ => Err(OtaError::SessionNotFound(id)),
        }
    }

    fn check_abort(&mut self, id: SessionId) -> OtaResult<()> {
        if !self.abort.is_aborted() {
            return Ok(());
        }
        let session = self.session_mut(id)?;
        session.abort("abort requested");
        let err = session.last_error().cloned().unwrap_or(OtaError::Aborted("abort requested"));
        self.retire_if_terminal();
        Err(err)
    }

    /// Record a failure that never opened a session
    fn reject(&mut self, err: OtaError) -> OtaError {
        log::error!("OTA begin rejected: {}", err);
        self.last = Some(StatusSnapshot {
            state: SessionState::Failed,
            last_error: Some(err.code()),
            ..StatusSnapshot::idle()
        });
        err
    }

    fn retire_if_terminal(&mut self) {
        let terminal = matches!(&self.session, Some((_, session)) if session.state().is_terminal());
        if terminal {
            if let Some((id, session)) = self.session.take() {
                self.last = Some(StatusSnapshot::of(id, &session));
            }
        }
    }
}
