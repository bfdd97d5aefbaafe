//! The PV channel table (§3 "Channel", §4.3).
//!
//! One [`Channel`] per compiler-emitted PV binding. Mediates between the
//! asynchronous callbacks a [`crate::pv::PvProvider`] delivers (possibly on
//! its own thread) and the synchronous view a state-set fiber expects —
//! §4.3's "Per-channel lock discipline": every mutable field lives behind
//! the channel's own [`crate::sync::Latch`], and get/put completion is
//! signalled through a dedicated [`crate::sync::Cond`] per direction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::compiler::CompiledChannel;
use crate::error::{ChannelError, Error};
use crate::event::EventFlagId;
use crate::program::Program;
use crate::pv::{PvCallbacks, PvMeta, PvType};
use crate::sync::{Cond, Latch};

struct ChannelState {
    resolved_name: String,
    /// `Arc` rather than `Box` so a caller can clone the handle out and
    /// drop the channel lock before calling into the provider — a provider
    /// may deliver its completion callback synchronously, re-entering this
    /// channel's methods on the same thread.
    handle: Option<Arc<dyn crate::pv::PvHandle>>,
    connected: bool,
    assigned: bool,
    status: i32,
    severity: i32,
    timestamp: f64,
    last_error: Option<String>,
    /// Latest raw bytes delivered by a monitor or get completion.
    value: Vec<u8>,
    /// Per-SS dirty flag: a fresh monitor value is waiting to be committed
    /// (safe mode) or has already been applied (non-safe mode, where it is
    /// set for bookkeeping/consistency even though the value was written
    /// straight into the shared variable area).
    dirty: Vec<bool>,
    get_complete: Vec<bool>,
    /// Per-SS: true while that SS has a synchronous get/put outstanding on
    /// this channel — used to suppress a racing monitor write in safe mode
    /// (§4.3 "copies value into the variable area only if the SS is not in
    /// the middle of a synchronous get/put on this channel").
    sync_op_in_progress: Vec<bool>,
    first_monitor_received: bool,
}

/// A single PV binding (§3 "Channel").
pub struct Channel {
    pub id: usize,
    pub var_name: String,
    pub var_type: String,
    pub var_offset: usize,
    pub count: usize,
    pub get_type: PvType,
    pub put_type: PvType,
    pub name_template: String,
    pub monitor: bool,
    pub queued: bool,
    pub event_flag: Option<EventFlagId>,
    pub sync_queue: Option<usize>,
    program: Weak<Program>,
    state: Latch<ChannelState>,
    get_cond: Cond,
    put_cond: Cond,
    lost_count: AtomicU64,
}

impl Channel {
    pub fn new(
        id: usize,
        compiled: &CompiledChannel,
        num_ss: usize,
        program: Weak<Program>,
    ) -> Result<Self, Error> {
        let get_type = PvType::from_var_type(&compiled.var_type)
            .ok_or_else(|| crate::error::StartupError::UnknownVarType(compiled.var_type.clone()))?;
        Ok(Channel {
            id,
            var_name: compiled.var_name.clone(),
            var_type: compiled.var_type.clone(),
            var_offset: compiled.var_offset,
            count: compiled.count,
            get_type,
            put_type: get_type,
            name_template: compiled.name_template.clone(),
            monitor: compiled.monitor,
            queued: compiled.queued,
            event_flag: compiled.event_flag,
            sync_queue: compiled.queue_index,
            program,
            state: Latch::new(ChannelState {
                resolved_name: String::new(),
                handle: None,
                connected: false,
                assigned: false,
                status: 0,
                severity: 0,
                timestamp: 0.0,
                last_error: None,
                value: vec![0u8; get_type.size() * compiled.count.max(1)],
                dirty: vec![false; num_ss],
                get_complete: vec![false; num_ss],
                sync_op_in_progress: vec![false; num_ss],
                first_monitor_received: !compiled.monitor,
            }),
            get_cond: Cond::new(),
            put_cond: Cond::new(),
            lost_count: AtomicU64::new(0),
        })
    }

    fn program(&self) -> Arc<Program> {
        self.program
            .upgrade()
            .expect("channel outlived its program")
    }

    pub fn resolved_name(&self) -> String {
        self.state.lock().resolved_name.clone()
    }

    pub fn is_assigned(&self) -> bool {
        self.state.lock().assigned
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn lost_count(&self) -> u64 {
        self.lost_count.load(Ordering::SeqCst)
    }

    /// Bind (or rebind) this channel to `name` (§4.3 "assign").
    pub fn assign(self: &Arc<Self>, name: String) -> Result<(), Error> {
        let program = self.program();
        {
            let mut st = self.state.lock();
            st.resolved_name = name.clone();
        }
        let callbacks: Arc<dyn PvCallbacks> = Arc::clone(self) as Arc<dyn PvCallbacks>;
        let handle = program.provider.var_create(&name, callbacks)?;
        {
            let mut st = self.state.lock();
            st.handle = Some(Arc::from(handle));
            st.assigned = true;
        }
        program.assign_count.fetch_add(1, Ordering::SeqCst);
        if self.monitor {
            let handle = self.state.lock().handle.clone();
            if let Some(handle) = handle {
                program.provider.var_monitor_on(handle.as_ref(), self.get_type);
            }
        }
        Ok(())
    }

    /// Issue a synchronous get, blocking the calling fiber until the
    /// provider's completion callback fires or `timeout` elapses (§4.3
    /// "get"). The handle is cloned out and the channel lock dropped
    /// before calling the provider, since a provider may deliver
    /// `on_get_complete` synchronously, re-entering this channel on the
    /// same thread.
    pub fn get_sync(&self, ss_id: usize, timeout: Duration) -> Result<Vec<u8>, Error> {
        let handle = {
            let mut st = self.state.lock();
            if !st.assigned {
                return Err(ChannelError::NotAssigned(st.resolved_name.clone()).into());
            }
            st.sync_op_in_progress[ss_id] = true;
            st.handle.clone()
        };
        if let Some(handle) = handle {
            self.program()
                .provider
                .var_get(handle.as_ref(), self.get_type, self.count);
        }
        let woke = self.get_cond.wait_timeout(timeout);
        let mut st = self.state.lock();
        st.sync_op_in_progress[ss_id] = false;
        if !woke {
            st.last_error = Some(format!("pvGet timed out on {}", st.resolved_name));
            return Err(ChannelError::GetTimeout(st.resolved_name.clone()).into());
        }
        st.get_complete[ss_id] = true;
        Ok(st.value.clone())
    }

    /// Issue a synchronous put (§4.3 "put"). Same re-entrancy precaution
    /// as [`Channel::get_sync`].
    pub fn put_sync(&self, ss_id: usize, timeout: Duration, data: &[u8]) -> Result<(), Error> {
        let handle = {
            let mut st = self.state.lock();
            if !st.assigned {
                return Err(ChannelError::NotAssigned(st.resolved_name.clone()).into());
            }
            st.sync_op_in_progress[ss_id] = true;
            st.handle.clone()
        };
        if let Some(handle) = handle {
            self.program()
                .provider
                .var_put(handle.as_ref(), self.put_type, data);
        }
        let woke = self.put_cond.wait_timeout(timeout);
        let mut st = self.state.lock();
        st.sync_op_in_progress[ss_id] = false;
        if !woke {
            st.last_error = Some(format!("pvPut timed out on {}", st.resolved_name));
            return Err(ChannelError::PutTimeout(st.resolved_name.clone()).into());
        }
        Ok(())
    }

    /// `true` if a fresh monitor value is waiting to be committed for `ss_id`
    /// (safe mode) — cleared by [`Channel::take_dirty`].
    pub fn is_dirty(&self, ss_id: usize) -> bool {
        self.state.lock().dirty[ss_id]
    }

    /// Commit the channel's latest value into the caller's safe-mode
    /// shadow and clear the per-SS dirty flag (§4.5 step 3a).
    pub fn take_dirty(&self, ss_id: usize) -> Option<Vec<u8>> {
        let mut st = self.state.lock();
        if st.dirty[ss_id] {
            st.dirty[ss_id] = false;
            Some(st.value.clone())
        } else {
            None
        }
    }

    pub fn get_complete(&self, ss_id: usize) -> bool {
        self.state.lock().get_complete[ss_id]
    }

    /// Snapshot read of status/severity/timestamp under the channel lock
    /// (§4.3 "pvStatus/severity/timestamp").
    pub fn status_snapshot(&self) -> (i32, i32, f64) {
        let st = self.state.lock();
        (st.status, st.severity, st.timestamp)
    }

    /// Most recent timeout/connection-loss message, if any (surfaced by
    /// [`crate::registry::show`]).
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn last_value(&self) -> Vec<u8> {
        self.state.lock().value.clone()
    }

    /// `true` once this channel has been assigned, connected, and — if
    /// monitored — delivered its first update (§4.6 step 8 "all-first-
    /// connect-and-monitor barrier").
    pub fn ready_for_barrier(&self) -> bool {
        let st = self.state.lock();
        st.assigned && st.connected && st.first_monitor_received
    }

    /// Cancel any monitor and release the provider-side handle (§4.6
    /// shutdown sequencing: "cancel monitors, disconnect channels").
    pub fn teardown(&self) {
        let handle = {
            let mut st = self.state.lock();
            st.connected = false;
            st.assigned = false;
            st.handle.take()
        };
        if let Some(handle) = handle {
            let program = self.program();
            if self.monitor {
                program.provider.var_monitor_off(handle.as_ref());
            }
            program.provider.var_destroy(handle.as_ref());
        }
    }
}

impl PvCallbacks for Channel {
    fn on_connect(&self, connected: bool, meta: PvMeta) {
        let program = self.program();
        let mut newly_connected = false;
        {
            let mut st = self.state.lock();
            if connected && !st.connected {
                newly_connected = true;
            }
            if !connected && st.connected {
                program.connect_count.fetch_sub(1, Ordering::SeqCst);
                st.last_error = Some(format!("{} disconnected", st.resolved_name));
            }
            st.connected = connected;
            st.status = meta.status;
            st.severity = meta.severity;
            st.timestamp = meta.timestamp;
        }
        if newly_connected {
            program.connect_count.fetch_add(1, Ordering::SeqCst);
        }
        program.maybe_release_connect_barrier();
    }

    fn on_monitor(&self, data: &[u8], meta: PvMeta) {
        let program = self.program();

        if self.queued {
            if let Some(queue_id) = self.sync_queue {
                let payload = crate::syncqueue::Payload {
                    value: data.to_vec(),
                    status: meta.status,
                    severity: meta.severity,
                    timestamp: meta.timestamp,
                };
                let dropped = program.push_sync_queue(queue_id, payload);
                if dropped {
                    self.lost_count.fetch_add(1, Ordering::SeqCst);
                }
                if let Some(ef) = self.event_flag {
                    program.event_flags.set(ef);
                }
            }
            return;
        }

        let mut st = self.state.lock();
        st.value.clear();
        st.value.extend_from_slice(data);
        st.status = meta.status;
        st.severity = meta.severity;
        st.timestamp = meta.timestamp;
        st.first_monitor_received = true;

        if program.options.contains(crate::compiler::ProgramOptions::SAFE) {
            for (ss_id, dirty) in st.dirty.iter_mut().enumerate() {
                if !st.sync_op_in_progress[ss_id] {
                    *dirty = true;
                }
            }
        } else {
            program.write_shared_var(self.var_offset, data);
            for dirty in st.dirty.iter_mut() {
                *dirty = true;
            }
        }
        drop(st);

        program.maybe_release_connect_barrier();
        if let Some(ef) = self.event_flag {
            program.event_flags.set(ef);
        }
    }

    fn on_get_complete(&self, data: &[u8], meta: PvMeta) {
        let mut st = self.state.lock();
        st.value.clear();
        st.value.extend_from_slice(data);
        st.status = meta.status;
        st.severity = meta.severity;
        st.timestamp = meta.timestamp;
        drop(st);
        self.get_cond.signal();
    }

    fn on_put_complete(&self, meta: PvMeta) {
        let mut st = self.state.lock();
        st.status = meta.status;
        st.severity = meta.severity;
        st.timestamp = meta.timestamp;
        drop(st);
        self.put_cond.signal();
    }
}
