//! Session management
//!
//! [`SessionManager`] drives the session lifecycle on top of the shared
//! [`TeeState`]: resolving a context for a UUID, gating entry into the
//! TA, quarantining contexts that panic and tearing sessions down.

use super::binding::Session;
use super::registry::{SessionRef, SessionRegistry};
use super::state::{CoreState, TeeState};
use crate::config::ManagerConfig;
use crate::error::{Error, ErrorOrigin, Result, TeeError, TeeResult};
use crate::tee::{Caller, Context, Identity, Login, Params, TaCall, TaFlags, TaLoader};
use crate::time::{cancel_deadline, SystemClock, TeeTime, TimeSource};
use parking_lot::MutexGuard;
use std::sync::Arc;
use uuid::Uuid;

/// Session manager serving one or more client channels
pub struct SessionManager {
    state: Arc<TeeState>,
    loaders: Vec<Arc<dyn TaLoader>>,
    clock: Arc<dyn TimeSource>,
    config: ManagerConfig,
}

impl SessionManager {
    /// Create a manager with default configuration and no loaders
    pub fn new() -> Self {
        Self::builder().build_unchecked()
    }

    pub fn builder() -> SessionManagerBuilder {
        SessionManagerBuilder::new()
    }

    /// Shared process-wide state
    pub fn state(&self) -> &Arc<TeeState> {
        &self.state
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub(crate) fn clock(&self) -> &dyn TimeSource {
        self.clock.as_ref()
    }

    /// Sessions opened from the non-secure side
    pub fn nsec_sessions(&self) -> SessionRegistry {
        self.state.nsec_sessions()
    }

    /// Create a session registry for another client channel
    pub fn create_registry(&self) -> SessionRegistry {
        self.state.create_registry()
    }

    /// Open a session to the TA identified by `uuid`.
    ///
    /// Returns the new session id. A failure after the TA's open entry
    /// point ran closes the session again with kernel identity; an earlier
    /// failure drops the session without entering the TA.
    pub fn open_session(
        &self,
        registry: &SessionRegistry,
        uuid: &Uuid,
        client: Identity,
        timeout_ms: u32,
        params: &mut Params,
    ) -> TeeResult<u32> {
        let session = match self.init_session(registry, uuid) {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!("init session failed {:#x}", e.code());
                return Err(TeeError::tee(e));
            }
        };
        let session = SessionRef::new(&self.state, session);
        let ctx = bound_context(&session);
        let id = session.id();

        let mut entered = false;
        let res = match self.check_params(&ctx, params) {
            Err(e) => Err(TeeError::tee(e)),
            Ok(()) => match self.state.try_acquire_busy(&ctx) {
                Err(e) => Err(TeeError::tee(e)),
                Ok(_busy) => {
                    let res = if ctx.is_panicked() {
                        Ok(())
                    } else {
                        entered = true;
                        session.set_client(client);
                        session.set_cancel_deadline(cancel_deadline(self.clock(), timeout_ms));
                        session.set_err_origin(ErrorOrigin::TrustedApp);

                        let mut call = TaCall::new(&session, &ctx, params, self.clock());
                        ctx.ops().enter_open_session(&mut call)
                    };

                    if ctx.is_panicked() {
                        self.release_panicked(&ctx);
                        Err(TeeError::tee(Error::TargetDead))
                    } else {
                        res.map_err(|e| TeeError::new(e, session.err_origin()))
                    }
                }
            },
        };
        drop(session);

        if let Err(e) = res {
            tracing::error!("Failed to open session to TA {}: {:#x}", uuid, e.code());
            if !entered {
                self.drop_unopened_session(registry, id);
            } else if let Err(close_err) = self.close_session(registry, id, &Caller::Kernel) {
                tracing::warn!("Failed to unwind session {}: {}", id, close_err);
            }
            return Err(e);
        }

        Ok(id)
    }

    /// Close a session and release its context reference.
    pub fn close_session(
        &self,
        registry: &SessionRegistry,
        id: u32,
        caller: &Caller,
    ) -> TeeResult<()> {
        let session = match self.state.get_session(registry, id, true) {
            Some(session) => session,
            None => {
                tracing::error!("Session {:#x} to be removed is not found", id);
                return Err(TeeError::tee(Error::ItemNotFound));
            }
        };
        check_client(&session, caller).map_err(TeeError::tee)?;

        tracing::debug!("Destroy session {:#x}", id);
        let ctx = bound_context(&session);

        if ctx.is_panicked() {
            self.state.unlink_session(session);
        } else {
            let busy = self.state.acquire_busy(&ctx);
            session.set_cancel_deadline(TeeTime::INFINITE);

            let mut params = Params::default();
            let mut call = TaCall::new(&session, &ctx, &mut params, self.clock());
            ctx.ops().enter_close_session(&mut call);

            self.state.unlink_session(session);
            drop(busy);
        }

        self.release_context_ref(&ctx);
        Ok(())
    }

    /// Invoke command `cmd` on an open session.
    pub fn invoke_command(
        &self,
        registry: &SessionRegistry,
        id: u32,
        caller: &Caller,
        timeout_ms: u32,
        cmd: u32,
        params: &mut Params,
    ) -> TeeResult<()> {
        let session = self
            .state
            .get_session(registry, id, true)
            .ok_or_else(|| TeeError::tee(Error::ItemNotFound))?;
        check_client(&session, caller).map_err(TeeError::tee)?;

        let ctx = bound_context(&session);
        self.check_params(&ctx, params).map_err(TeeError::tee)?;

        let busy = self.state.try_acquire_busy(&ctx).map_err(TeeError::tee)?;

        let res = if ctx.is_panicked() {
            Ok(())
        } else {
            session.set_cancel_deadline(cancel_deadline(self.clock(), timeout_ms));
            session.set_err_origin(ErrorOrigin::TrustedApp);

            let mut call = TaCall::new(&session, &ctx, params, self.clock());
            ctx.ops().enter_invoke_cmd(&mut call, cmd)
        };

        let res = if ctx.is_panicked() {
            self.release_panicked(&ctx);
            Err(TeeError::tee(Error::TargetDead))
        } else {
            res.map_err(|e| TeeError::new(e, session.err_origin()))
        };
        drop(busy);

        if let Err(e) = &res {
            if !e.error.is_short_buffer() {
                tracing::debug!("Error: {:#x} of {:?}", e.code(), e.origin);
            }
        }
        res
    }

    /// Request cancellation of whatever the session is doing. Never blocks.
    pub fn cancel_command(
        &self,
        registry: &SessionRegistry,
        id: u32,
        caller: &Caller,
    ) -> TeeResult<()> {
        let session = self
            .state
            .get_session(registry, id, false)
            .ok_or_else(|| TeeError::tee(Error::ItemNotFound))?;
        check_client(&session, caller).map_err(TeeError::tee)?;

        session.request_cancel();
        Ok(())
    }

    /// Cancellation check against this manager's clock
    pub fn is_cancelled(&self, session: &Session, now: Option<TeeTime>) -> bool {
        session.is_cancelled(self.clock(), now)
    }

    /// Remove a session whose open entry point never ran.
    ///
    /// Skips the busy gate: the caller may be the thread the context is
    /// busy with.
    fn drop_unopened_session(&self, registry: &SessionRegistry, id: u32) {
        let Some(session) = self.state.get_session(registry, id, true) else {
            return;
        };
        let ctx = bound_context(&session);
        self.state.unlink_session(session);
        self.release_context_ref(&ctx);
    }

    /// Register a session and bind it to a context for `uuid`.
    ///
    /// The returned session carries the opener's borrow.
    fn init_session(&self, registry: &SessionRegistry, uuid: &Uuid) -> Result<Arc<Session>> {
        let mut st = self.state.lock();
        let session = self.state.insert_session(&mut st, registry)?;

        match self.bind_loaded_context(&mut st, &session, uuid) {
            Ok(()) => return Ok(session),
            Err(Error::ItemNotFound) => {}
            Err(e) => {
                self.state.discard_session(&mut st, &session);
                return Err(e);
            }
        }

        let (loader, flags) = match self.lookup(uuid) {
            Ok(found) => found,
            Err(e) => {
                self.state.discard_session(&mut st, &session);
                return Err(e);
            }
        };

        let ctx = st.register_context(*uuid, flags, loader.kind());
        session.bind_context(ctx.clone());
        drop(st);

        let loaded = loader.instantiate(uuid);

        let mut st = self.state.lock();
        match loaded {
            Ok(ops) => {
                ctx.install_ops(ops);
                st.book_mut(ctx.id()).is_initializing = false;
                self.state.init_cv.notify_all();
                tracing::info!("Loaded {} TA {}", loader.kind().as_str(), uuid);
                Ok(session)
            }
            Err(e) => {
                st.unregister_context(ctx.id());
                st.books.remove(&ctx.id());
                self.state.discard_session(&mut st, &session);
                self.state.init_cv.notify_all();
                Err(e)
            }
        }
    }

    /// Bind `session` to an already loaded single-instance context.
    ///
    /// A single-session TA that already has a session is waited for until
    /// that session closes, unless the caller could never see it close.
    fn bind_loaded_context(
        &self,
        st: &mut MutexGuard<'_, CoreState>,
        session: &Session,
        uuid: &Uuid,
    ) -> Result<()> {
        loop {
            let ctx = st.find_context(uuid).ok_or(Error::ItemNotFound)?;
            let book = st.book(ctx.id());
            if book.is_initializing {
                // The context may be gone after the wait: search again
                self.state.init_cv.wait(st);
                continue;
            }

            // Multi-instance TAs get a fresh context per session
            if !ctx.flags().is_single_instance() {
                return Err(Error::ItemNotFound);
            }

            if !ctx.flags().contains(TaFlags::MULTI_SESSION) && book.ref_count > 0 {
                let me = std::thread::current().id();
                if book.busy == Some(me) || self.state.has_single_instance_lock(&**st) {
                    return Err(Error::Busy);
                }
                self.state.idle_cv.wait(st);
                continue;
            }

            tracing::debug!("Re-open trusted service {}", uuid);
            st.book_mut(ctx.id()).ref_count += 1;
            session.bind_context(ctx);
            return Ok(());
        }
    }

    /// First loader, in precedence order, that provides `uuid`.
    fn lookup(&self, uuid: &Uuid) -> Result<(&Arc<dyn TaLoader>, TaFlags)> {
        for loader in &self.loaders {
            match loader.lookup(uuid) {
                Ok(flags) => return Ok((loader, flags)),
                Err(Error::ItemNotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::ItemNotFound)
    }

    /// Reject secure-data-path memory the context cannot handle.
    fn check_params(&self, ctx: &Context, params: &Params) -> Result<()> {
        if !params.has_sdp_memref() {
            return Ok(());
        }
        if !self.config.secure_data_path {
            return Err(Error::BadParameters(
                "secure data path memory is not supported".to_string(),
            ));
        }
        if !ctx.flags().contains(TaFlags::SECURE_DATA_PATH) {
            return Err(Error::BadParameters(format!(
                "TA {} does not accept secure data path memory",
                ctx.uuid()
            )));
        }
        Ok(())
    }

    /// Quarantine a context that panicked while the caller had it busy.
    pub(crate) fn release_panicked(&self, ctx: &Context) {
        if ctx.flags().keep_crashed() {
            return;
        }

        let was_releasing = {
            let mut st = self.state.lock();
            let was_releasing =
                std::mem::replace(&mut st.book_mut(ctx.id()).is_releasing, true);
            if !was_releasing {
                tracing::debug!("Releasing panicked TA ctx {}", ctx.uuid());
                st.unregister_context(ctx.id());
            }
            was_releasing
        };

        if !was_releasing {
            ctx.ops().release_state();
        }
    }

    /// Drop one context reference; destroy the context once idle unless retained.
    fn release_context_ref(&self, ctx: &Context) {
        let destroy = {
            let mut st = self.state.lock();
            let book = st.book_mut(ctx.id());
            assert!(book.ref_count > 0, "TA {} ref count underflow", ctx.uuid());
            book.ref_count -= 1;
            if book.ref_count == 0 {
                self.state.idle_cv.notify_all();
            }

            if book.ref_count > 0 || !ctx.flags().destroy_when_idle(ctx.is_panicked()) {
                false
            } else {
                if !std::mem::replace(&mut book.is_releasing, true) {
                    st.unregister_context(ctx.id());
                }
                st.books.remove(&ctx.id());
                true
            }
        };

        if destroy {
            tracing::info!("Destroying TA {} ({})", ctx.uuid(), ctx.kind().as_str());
            ctx.ops().destroy();
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state)
            .field("loaders", &self.loaders.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn bound_context(session: &Session) -> Arc<Context> {
    match session.context() {
        Some(ctx) => ctx.clone(),
        None => panic!("session {} has no context", session.id()),
    }
}

/// Verify `caller` may act on `session`.
fn check_client(session: &Session, caller: &Caller) -> Result<()> {
    let denied = match caller {
        Caller::Kernel => false,
        Caller::NonSecure => {
            let hijack = session.client().login == Login::TrustedApp;
            if hijack {
                tracing::debug!("nsec tries to hijack TA session {:#x}", session.id());
            }
            hijack
        }
        Caller::Client(identity) => {
            let mismatch = *identity != session.client();
            if mismatch {
                tracing::debug!("client id mismatch on session {:#x}", session.id());
            }
            mismatch
        }
    };

    if denied {
        // Deliberately generic towards the caller
        return Err(Error::BadParameters("client identity mismatch".to_string()));
    }
    Ok(())
}

/// Builder for [`SessionManager`]
pub struct SessionManagerBuilder {
    config: ManagerConfig,
    state: Option<Arc<TeeState>>,
    loaders: Vec<Arc<dyn TaLoader>>,
    clock: Option<Arc<dyn TimeSource>>,
}

impl SessionManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
            state: None,
            loaders: Vec::new(),
            clock: None,
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing state object instead of creating one
    pub fn state(mut self, state: Arc<TeeState>) -> Self {
        self.state = Some(state);
        self
    }

    /// Add a TA loader backend
    pub fn loader(mut self, loader: Arc<dyn TaLoader>) -> Self {
        self.loaders.push(loader);
        self
    }

    /// Set the time source (defaults to the system clock)
    pub fn clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the manager
    pub fn build(self) -> Result<SessionManager> {
        if let Some(state) = &self.state {
            if state.concurrent_single_instance() != self.config.concurrent_single_instance {
                return Err(Error::Config(
                    "concurrent_single_instance differs from the shared state".to_string(),
                ));
            }
        }

        let mut kinds: Vec<_> = self.loaders.iter().map(|l| l.kind()).collect();
        kinds.sort();
        kinds.dedup();
        if kinds.len() != self.loaders.len() {
            return Err(Error::Config("duplicate TA loader kind".to_string()));
        }

        Ok(self.build_unchecked())
    }

    fn build_unchecked(mut self) -> SessionManager {
        // Secure partitions, then pseudo TAs, then user TAs
        self.loaders.sort_by_key(|l| l.kind());

        let state = self.state.unwrap_or_else(|| {
            Arc::new(TeeState::new(self.config.concurrent_single_instance))
        });

        SessionManager {
            state,
            loaders: self.loaders,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config: self.config,
        }
    }
}

impl Default for SessionManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
