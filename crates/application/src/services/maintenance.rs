use config::AppConfig;
use domain::{ChangeEvent, DomainError, RoomId, Timestamp};

use crate::error::ApplicationError;

use super::reconnection::HistoryRecorder;
use super::registry::ParticipantRegistry;
use super::{publish, CoreDependencies};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    /// 超过该时长无心跳的在线记录视为掉线
    pub stale_after: time::Duration,
    /// 等待中的房间超过该时长且无人在线时结束
    pub waiting_ttl: time::Duration,
}

impl From<&AppConfig> for SweepPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            stale_after: seconds(config.presence.stale_after_secs),
            waiting_ttl: seconds(config.rooms.waiting_ttl_secs),
        }
    }
}

fn seconds(secs: u64) -> time::Duration {
    time::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

fn cutoff(
    now: Timestamp,
    window: time::Duration,
    field: &'static str,
) -> Result<Timestamp, ApplicationError> {
    now.checked_sub(window)
        .ok_or_else(|| DomainError::invalid_argument(field, "window is out of range").into())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_sessions: usize,
    pub ended_rooms: Vec<RoomId>,
}

/// 清理掉线会话和被遗弃的等待房间。核心不持有定时器，由调用方按间隔驱动。
#[derive(Clone)]
pub struct PresenceSweeper {
    deps: CoreDependencies,
    registry: ParticipantRegistry,
    history: HistoryRecorder,
    policy: SweepPolicy,
}

impl PresenceSweeper {
    pub fn new(deps: CoreDependencies, policy: SweepPolicy) -> Self {
        Self {
            registry: ParticipantRegistry::new(deps.clone()),
            history: HistoryRecorder::new(deps.clone()),
            deps,
            policy,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, ApplicationError> {
        let now = self.deps.clock.now();
        let stale_cutoff = cutoff(now, self.policy.stale_after, "stale_after")?;
        let waiting_cutoff = cutoff(now, self.policy.waiting_ttl, "waiting_ttl")?;
        let mut report = SweepReport::default();

        // 掉线会话走正常的离开路径，房间结束判断与事件保持一致
        let stale = self.deps.participants.list_stale(stale_cutoff).await?;
        for participant in stale {
            let outcome = self
                .registry
                .expire_session(
                    participant.room_id,
                    participant.device_id,
                    participant.session_id,
                )
                .await?;
            report.expired_sessions += outcome.marked_offline.len();
            if let Some(room) = outcome.room_ended {
                // 双方都掉线结束的聊天同样留下历史连接
                let members = self.deps.participants.list_for_room(room.id).await?;
                self.history
                    .record(room.id, participant.device_id, &members)
                    .await?;
                report.ended_rooms.push(room.id);
            }
        }

        let abandoned = self
            .deps
            .rooms
            .list_waiting_created_before(waiting_cutoff)
            .await?;
        for room in abandoned {
            if let Some(ended) = self.deps.rooms.end_if_vacant(room.id, now).await? {
                tracing::info!(room_id = %ended.id, "结束被遗弃的等待房间");
                report.ended_rooms.push(ended.id);
                publish(self.deps.bus.as_ref(), ChangeEvent::RoomChanged { room: ended }).await;
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                expired = report.expired_sessions,
                ended = report.ended_rooms.len(),
                "在线状态清理完成"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tests::Harness;
    use domain::{RoomStatus, SessionId};
    use time::Duration;

    fn policy() -> SweepPolicy {
        SweepPolicy {
            stale_after: Duration::seconds(120),
            waiting_ttl: Duration::seconds(600),
        }
    }

    #[tokio::test]
    async fn fresh_sessions_are_left_alone() {
        let harness = Harness::new();
        let (room, _, _) = harness.matched_pair().await;
        harness.clock.advance(Duration::seconds(60));

        let report = PresenceSweeper::new(harness.deps(), policy())
            .sweep()
            .await
            .unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(harness.room(room.id).await.status, RoomStatus::Active);
    }

    #[tokio::test]
    async fn silent_sessions_expire_and_end_room() {
        let harness = Harness::new();
        let (room, a, _) = harness.matched_pair().await;
        let a_session = harness.session_of(room.id, a.device_id).await;
        harness.clock.advance(Duration::seconds(100));
        harness
            .registry()
            .heartbeat(room.id, a.device_id, a_session)
            .await
            .unwrap();
        harness.clock.advance(Duration::seconds(60));

        let sweeper = PresenceSweeper::new(harness.deps(), policy());
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.expired_sessions, 1);
        assert!(report.ended_rooms.is_empty());

        harness.clock.advance(Duration::seconds(200));
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.expired_sessions, 1);
        assert_eq!(report.ended_rooms, vec![room.id]);
        assert_eq!(harness.room(room.id).await.status, RoomStatus::Ended);
    }

    #[tokio::test]
    async fn chat_ended_by_sweep_is_kept_in_history() {
        let harness = Harness::new();
        let (room, a, b) = harness.matched_pair().await;
        harness.clock.advance(Duration::seconds(1000));

        let report = PresenceSweeper::new(harness.deps(), policy())
            .sweep()
            .await
            .unwrap();
        assert_eq!(report.ended_rooms, vec![room.id]);

        let manager = harness.reconnection();
        let history = manager.list_history(a.device_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].connection_count, 1);
        assert!(history[0].pair().contains(b.device_id));
        assert_eq!(history[0].room_id, room.id);
    }

    #[tokio::test]
    async fn lone_waiting_session_expiring_records_nothing() {
        let harness = Harness::new();
        let a = harness.identity();
        harness
            .matcher()
            .find_or_create_room(&a, SessionId::random())
            .await
            .unwrap();
        harness.clock.advance(Duration::seconds(200));

        let report = PresenceSweeper::new(harness.deps(), policy())
            .sweep()
            .await
            .unwrap();
        assert_eq!(report.ended_rooms.len(), 1);
        assert!(harness
            .reconnection()
            .list_history(a.device_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn oversized_window_is_an_error_not_a_panic() {
        let harness = Harness::new();
        harness.matched_pair().await;
        let mut config = AppConfig::default();
        config.presence.stale_after_secs = u64::MAX;

        let err = PresenceSweeper::new(harness.deps(), SweepPolicy::from(&config))
            .sweep()
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::Domain(DomainError::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn abandoned_waiting_room_ends_once_creator_is_gone() {
        let harness = Harness::new();
        let a = harness.identity();
        let waiting = harness
            .matcher()
            .find_or_create_room(&a, SessionId::random())
            .await
            .unwrap();
        let sweeper = PresenceSweeper::new(harness.deps(), policy());

        // 创建者仍有心跳时保留
        harness.clock.advance(Duration::seconds(700));
        harness
            .registry()
            .heartbeat(waiting.room.id, a.device_id, waiting.participant.session_id)
            .await
            .unwrap();
        let report = sweeper.sweep().await.unwrap();
        assert!(report.ended_rooms.is_empty());

        harness.clock.advance(Duration::seconds(300));
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.ended_rooms, vec![waiting.room.id]);
        assert_eq!(
            harness.room(waiting.room.id).await.status,
            RoomStatus::Ended
        );
        // 被结束的房间不会再被匹配
        let next = harness
            .matcher()
            .find_or_create_room(&harness.identity(), SessionId::random())
            .await
            .unwrap();
        assert_ne!(next.room.id, waiting.room.id);
    }

    #[test]
    fn policy_reads_config() {
        let config = AppConfig::default();
        let policy = SweepPolicy::from(&config);
        assert_eq!(policy.stale_after, Duration::seconds(120));
        assert_eq!(policy.waiting_ttl, Duration::seconds(600));
    }
}
