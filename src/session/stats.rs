//! Per-TA instance statistics

use super::binding::Session;
use super::manager::SessionManager;
use super::registry::SessionRegistry;
use crate::error::{Error, Result};
use crate::tee::{HeapStats, Params, TaCall, TaKind};
use crate::time::TeeTime;
use bytes::BufMut;
use serde::Serialize;
use uuid::Uuid;

/// Size of one serialized [`TaStats`] record
pub const TA_STATS_RECORD_SIZE: usize = 48;

/// Statistics of one user TA instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaStats {
    pub uuid: Uuid,
    pub panicked: bool,
    /// Non-secure sessions bound to the instance, capped at the dump limit
    pub sess_num: u32,
    pub heap: HeapStats,
}

impl TaStats {
    /// Append the fixed little-endian record layout.
    fn write_to(&self, out: &mut impl BufMut) {
        let (time_low, time_mid, time_hi, clock_seq) = self.uuid.as_fields();
        out.put_u32_le(time_low);
        out.put_u16_le(time_mid);
        out.put_u16_le(time_hi);
        out.put_slice(clock_seq);

        out.put_u32_le(u32::from(self.panicked));
        out.put_u32_le(self.sess_num);

        out.put_u32_le(self.heap.allocated);
        out.put_u32_le(self.heap.max_allocated);
        out.put_u32_le(self.heap.size);
        out.put_u32_le(self.heap.num_alloc_fail);
        out.put_u32_le(self.heap.biggest_alloc_fail);
        out.put_u32_le(self.heap.biggest_alloc_fail_used);
    }
}

struct DumpCtx {
    uuid: Uuid,
    panicked: bool,
    sess_ids: Vec<u32>,
}

impl SessionManager {
    /// Statistics for every user TA instance in the registry.
    ///
    /// `Error::ItemNotFound` when no user TA is loaded.
    pub fn instance_stats(&self) -> Result<Vec<TaStats>> {
        let nsec = self.nsec_sessions();
        let snapshot = self.snapshot_user_tas(&nsec);
        if snapshot.is_empty() {
            return Err(Error::ItemNotFound);
        }

        Ok(snapshot
            .into_iter()
            .map(|dump| self.collect_stats(&nsec, dump))
            .collect())
    }

    /// Serialize [`SessionManager::instance_stats`] into `buf`.
    ///
    /// Returns the number of bytes written. A buffer that is too small
    /// yields `Error::ShortBuffer` carrying the required size.
    pub fn instance_stats_into(&self, buf: &mut [u8]) -> Result<usize> {
        let nsec = self.nsec_sessions();
        let snapshot = self.snapshot_user_tas(&nsec);
        if snapshot.is_empty() {
            return Err(Error::ItemNotFound);
        }

        let required = snapshot.len() * TA_STATS_RECORD_SIZE;
        if buf.len() < required {
            return Err(Error::ShortBuffer { required });
        }
        if buf.as_ptr() as usize % std::mem::align_of::<u32>() != 0 {
            tracing::debug!("Data alignment");
            return Err(Error::BadParameters(
                "stats buffer is not 4-byte aligned".to_string(),
            ));
        }

        let mut out = &mut buf[..required];
        for dump in snapshot {
            self.collect_stats(&nsec, dump).write_to(&mut out);
        }
        Ok(required)
    }

    fn snapshot_user_tas(&self, nsec: &SessionRegistry) -> Vec<DumpCtx> {
        let max_sessions = self.config().max_dump_sessions;
        let st = self.state().lock();
        let sessions = st.session_list(nsec.id());

        st.contexts
            .iter()
            .filter(|ctx| ctx.kind() == TaKind::User)
            .map(|ctx| DumpCtx {
                uuid: *ctx.uuid(),
                panicked: ctx.is_panicked(),
                sess_ids: sessions
                    .iter()
                    .filter(|slot| slot.session.context().map(|c| c.id()) == Some(ctx.id()))
                    .map(|slot| slot.session.id())
                    .take(max_sessions)
                    .collect(),
            })
            .collect()
    }

    fn collect_stats(&self, nsec: &SessionRegistry, dump: DumpCtx) -> TaStats {
        let session = dump
            .sess_ids
            .iter()
            .find_map(|id| self.state().get_session(nsec, *id, true));

        let heap = match session {
            Some(session) => self.dump_ta_memstats(&session).unwrap_or_else(|e| {
                tracing::debug!("No heap stats for TA {}: {}", dump.uuid, e);
                HeapStats::default()
            }),
            None => HeapStats::default(),
        };

        TaStats {
            uuid: dump.uuid,
            panicked: dump.panicked,
            sess_num: dump.sess_ids.len() as u32,
            heap,
        }
    }

    fn dump_ta_memstats(&self, session: &Session) -> Result<HeapStats> {
        let ctx = session.context().cloned().ok_or(Error::ItemNotFound)?;
        if self.state().is_initializing(&ctx) {
            return Err(Error::BadState(format!("TA {} is initializing", ctx.uuid())));
        }

        let _busy = self.state().try_acquire_busy(&ctx)?;

        let res = if ctx.is_panicked() {
            Ok(HeapStats::default())
        } else {
            session.set_cancel_deadline(TeeTime::INFINITE);
            let mut params = Params::default();
            let mut call = TaCall::new(session, &ctx, &mut params, self.clock());
            ctx.ops().dump_mem_stats(&mut call)
        };

        if ctx.is_panicked() {
            self.release_panicked(&ctx);
            return Err(Error::TargetDead);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TeeResult;
    use crate::tee::{Identity, Login, PseudoTaTable, TaFlags, TaOps};
    use crate::testing::{ScriptedLoader, ScriptedTa};
    use crate::time::TIMEOUT_INFINITE;
    use std::sync::Arc;

    const TA: Uuid = Uuid::from_u128(0xd96a5b40_c3e5_21e3_8794_1002a5d5c61b);

    #[repr(align(4))]
    struct Aligned([u8; 2 * TA_STATS_RECORD_SIZE + 8]);

    fn heap() -> HeapStats {
        HeapStats {
            allocated: 4096,
            max_allocated: 8192,
            size: 65536,
            num_alloc_fail: 1,
            biggest_alloc_fail: 32768,
            biggest_alloc_fail_used: 4096,
        }
    }

    fn manager(flags: TaFlags, ta: fn() -> ScriptedTa) -> SessionManager {
        SessionManager::builder()
            .loader(Arc::new(
                ScriptedLoader::new(TaKind::User).with_ta(TA, flags, ta),
            ))
            .build()
            .unwrap()
    }

    fn open(m: &SessionManager) -> TeeResult<u32> {
        m.open_session(
            &m.nsec_sessions(),
            &TA,
            Identity::new(Login::Public, Uuid::nil()),
            TIMEOUT_INFINITE,
            &mut Params::default(),
        )
    }

    #[test]
    fn test_no_user_ta() {
        let pseudo = Uuid::new_v4();
        let mut table = PseudoTaTable::new();
        table
            .register("stats", pseudo, TaFlags::empty(), Arc::new(|| {
                Arc::new(ScriptedTa::new()) as Arc<dyn TaOps>
            }))
            .unwrap();
        let m = SessionManager::builder()
            .loader(Arc::new(table))
            .build()
            .unwrap();

        m.open_session(
            &m.nsec_sessions(),
            &pseudo,
            Identity::default(),
            TIMEOUT_INFINITE,
            &mut Params::default(),
        )
        .unwrap();

        assert!(matches!(m.instance_stats(), Err(Error::ItemNotFound)));
        assert!(matches!(
            m.instance_stats_into(&mut [0u8; 64]),
            Err(Error::ItemNotFound)
        ));
    }

    #[test]
    fn test_heap_stats_reported() {
        let m = manager(TaFlags::SINGLE_INSTANCE | TaFlags::MULTI_SESSION, || {
            ScriptedTa::new().heap(heap())
        });
        open(&m).unwrap();
        open(&m).unwrap();

        let stats = m.instance_stats().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].uuid, TA);
        assert!(!stats[0].panicked);
        assert_eq!(stats[0].sess_num, 2);
        assert_eq!(stats[0].heap, heap());

        let json = serde_json::to_value(&stats[0]).unwrap();
        assert_eq!(json["heap"]["allocated"], 4096);
    }

    #[test]
    fn test_noop_invoke_leaves_stats_unchanged() {
        let m = manager(TaFlags::SINGLE_INSTANCE | TaFlags::MULTI_SESSION, || {
            ScriptedTa::new().heap(heap())
        });
        let nsec = m.nsec_sessions();
        let id = open(&m).unwrap();
        let before = m.instance_stats().unwrap();

        m.invoke_command(
            &nsec,
            id,
            &crate::tee::Caller::NonSecure,
            TIMEOUT_INFINITE,
            1,
            &mut Params::default(),
        )
        .unwrap();
        assert_eq!(m.instance_stats().unwrap(), before);

        m.close_session(&nsec, id, &crate::tee::Caller::NonSecure)
            .unwrap();
        assert!(matches!(m.instance_stats(), Err(Error::ItemNotFound)));
    }

    #[test]
    fn test_unsupported_dump_zeroes_heap() {
        let m = manager(TaFlags::empty(), ScriptedTa::new);
        open(&m).unwrap();

        let stats = m.instance_stats().unwrap();
        assert_eq!(stats[0].sess_num, 1);
        assert_eq!(stats[0].heap, HeapStats::default());
    }

    #[test]
    fn test_session_count_capped() {
        let m = SessionManager::builder()
            .config(crate::config::ManagerConfig {
                max_dump_sessions: 2,
                ..Default::default()
            })
            .loader(Arc::new(ScriptedLoader::new(TaKind::User).with_ta(
                TA,
                TaFlags::SINGLE_INSTANCE | TaFlags::MULTI_SESSION,
                ScriptedTa::new,
            )))
            .build()
            .unwrap();
        for _ in 0..3 {
            open(&m).unwrap();
        }

        assert_eq!(m.instance_stats().unwrap()[0].sess_num, 2);
    }

    #[test]
    fn test_panicked_instance() {
        let m = manager(
            TaFlags::SINGLE_INSTANCE
                | TaFlags::MULTI_SESSION
                | TaFlags::INSTANCE_KEEP_ALIVE
                | TaFlags::INSTANCE_KEEP_CRASHED,
            || {
                ScriptedTa::new().heap(heap()).on_invoke(|call, _| {
                    call.mark_panicked();
                    Ok(())
                })
            },
        );
        let id = open(&m).unwrap();
        let _ = m.invoke_command(
            &m.nsec_sessions(),
            id,
            &crate::tee::Caller::Kernel,
            TIMEOUT_INFINITE,
            0,
            &mut Params::default(),
        );

        let stats = m.instance_stats().unwrap();
        assert!(stats[0].panicked);
        assert_eq!(stats[0].heap, HeapStats::default());
    }

    #[test]
    fn test_serialized_records() {
        let m = manager(TaFlags::empty(), || ScriptedTa::new().heap(heap()));
        open(&m).unwrap();

        let mut buf = Aligned([0xff; 2 * TA_STATS_RECORD_SIZE + 8]);
        let written = m.instance_stats_into(&mut buf.0[..]).unwrap();
        assert_eq!(written, TA_STATS_RECORD_SIZE);

        let record = &buf.0[..written];
        let (time_low, _, _, _) = TA.as_fields();
        assert_eq!(&record[0..4], &time_low.to_le_bytes());
        assert_eq!(&record[8..16], &TA.as_bytes()[8..16]);
        assert_eq!(&record[16..20], &0u32.to_le_bytes());
        assert_eq!(&record[20..24], &1u32.to_le_bytes());
        assert_eq!(&record[24..28], &4096u32.to_le_bytes());
        assert_eq!(&record[36..40], &1u32.to_le_bytes());
        // Bytes past the records are untouched
        assert_eq!(buf.0[written], 0xff);
    }

    #[test]
    fn test_short_and_misaligned_buffers() {
        let m = manager(TaFlags::empty(), ScriptedTa::new);
        open(&m).unwrap();
        open(&m).unwrap();

        let mut buf = Aligned([0; 2 * TA_STATS_RECORD_SIZE + 8]);
        assert!(matches!(
            m.instance_stats_into(&mut buf.0[..TA_STATS_RECORD_SIZE]),
            Err(Error::ShortBuffer { required }) if required == 2 * TA_STATS_RECORD_SIZE
        ));
        assert!(matches!(
            m.instance_stats_into(&mut buf.0[1..]),
            Err(Error::BadParameters(_))
        ));
        assert_eq!(
            m.instance_stats_into(&mut buf.0[..]).unwrap(),
            2 * TA_STATS_RECORD_SIZE
        );
    }
}
