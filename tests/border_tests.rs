//! Border detection and avatar handoff between two neighboring regions.

mod common;

#[cfg(test)]
mod tests {
    use crate::common::{at, eventually, pair, pair_with, RecordingChannel};
    use region_sim::protocol::{capabilities, client_events};
    use region_sim::{HandoffError, SceneEntity, ScenePresence, TransportError, Vec3};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    fn login(
        region: &region_sim::RegionService,
        position: Vec3,
    ) -> (Arc<ScenePresence>, Arc<RecordingChannel>) {
        let channel = Arc::new(RecordingChannel::default());
        let presence = region.add_presence(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Walker",
            position,
            channel.clone(),
        );
        (presence, channel)
    }

    // -----------------------------------------------------------------------
    // Detection
    // -----------------------------------------------------------------------

    #[test]
    fn detection_respects_border_margin() {
        let p = pair();
        let (x, _) = login(&p.a, at(254.0, 128.0));
        assert!(p.a.border().detect(x.as_ref()).is_none());

        x.set_relative_position(at(257.0, 128.0));
        assert!(p.a.border().detect(x.as_ref()).is_none());

        x.set_relative_position(at(262.0, 128.0));
        let dest = p.a.border().detect(x.as_ref()).map(|d| d.id);
        assert_eq!(dest, Some(p.b.config().region_id));
    }

    #[test]
    fn no_region_beyond_the_edge_means_no_crossing() {
        let p = pair();
        let (x, _) = login(&p.a, at(-10.0, 128.0));
        assert!(p.a.border().detect(x.as_ref()).is_none());
    }

    // -----------------------------------------------------------------------
    // Handoff
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn successful_handoff_demotes_and_notifies_client() {
        let p = pair();
        let (x, channel) = login(&p.a, at(257.0, 128.0));
        let dest = p.a.border().detect(x.as_ref());
        assert!(dest.is_none(), "still inside the margin");

        let b_info = crate::common::scene_info(p.b.config());
        let response = p.a.border().cross_agent(&x, &b_info).await.unwrap();
        assert!(response.connect);
        assert_eq!(response.sim_port, Some(9001));

        // Demoted here, root over there at the translated position.
        assert!(x.is_child());
        assert_eq!(x.origin_region(), Some(p.b.config().region_id));
        let arrived = p.b.scene().try_get_presence(&x.id()).unwrap();
        assert!(arrived.is_root());
        assert_eq!(arrived.session_id(), x.session_id());
        assert_eq!(arrived.scene_position(), Vec3::new(1.0, 128.0, 25.0));

        assert_eq!(
            channel.types(),
            vec![
                client_events::ENABLE_SIMULATOR.to_string(),
                client_events::ESTABLISH_AGENT_COMMUNICATION.to_string(),
            ]
        );
        let (_, establish) = &channel.events()[1];
        assert_eq!(establish["seed_capability"], json!("http://b/caps/seed"));
        assert_eq!(establish["sim_host"], json!("10.0.0.2"));
    }

    #[tokio::test]
    async fn rejected_handoff_keeps_presence_root() {
        let p = pair();
        p.connector_b.refuse_all();
        let (x, channel) = login(&p.a, at(262.0, 128.0));
        let b_info = crate::common::scene_info(p.b.config());

        let err = p.a.border().cross_agent(&x, &b_info).await.unwrap_err();
        assert!(matches!(
            err,
            HandoffError::Transport(TransportError::Status(403))
        ));

        assert!(x.is_root());
        assert!(p.a.scene().try_get_presence(&x.id()).is_some());
        assert!(p.b.scene().try_get_presence(&x.id()).is_none());
        assert!(channel.events().is_empty());
        assert!(p.a.border().is_throttled(&x.id(), Instant::now()));
    }

    #[tokio::test]
    async fn timed_out_handoff_keeps_presence_root() {
        let p = pair_with(|c| c.handoff_timeout_ms = 50);
        p.transport.set_delay(Duration::from_millis(200));
        let (x, _) = login(&p.a, at(262.0, 128.0));
        let b_info = crate::common::scene_info(p.b.config());

        let err = p.a.border().cross_agent(&x, &b_info).await.unwrap_err();
        assert!(matches!(err, HandoffError::Timeout));
        assert!(x.is_root());
    }

    #[tokio::test]
    async fn accepted_reply_without_endpoint_is_refused() {
        let p = pair();
        p.transport
            .override_verb(capabilities::REZ_AVATAR_REQUEST, json!({ "connect": true }));
        let (x, channel) = login(&p.a, at(262.0, 128.0));
        let b_info = crate::common::scene_info(p.b.config());

        let err = p.a.border().cross_agent(&x, &b_info).await.unwrap_err();
        assert!(matches!(err, HandoffError::Malformed(_)));
        assert!(x.is_root());
        assert!(channel.events().is_empty());
    }

    #[tokio::test]
    async fn network_failure_keeps_presence_root() {
        let p = pair();
        p.transport.fail_verb(capabilities::REZ_AVATAR_REQUEST);
        let (x, _) = login(&p.a, at(262.0, 128.0));
        let b_info = crate::common::scene_info(p.b.config());

        let err = p.a.border().cross_agent(&x, &b_info).await.unwrap_err();
        assert!(matches!(
            err,
            HandoffError::Transport(TransportError::Network(_))
        ));
        assert!(x.is_root());
    }

    // -----------------------------------------------------------------------
    // Tick-driven crossings
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn tick_dispatches_handoff_in_background() {
        let p = pair();
        let (x, _) = login(&p.a, at(262.0, 128.0));

        let report = p.a.tick();
        assert_eq!(report.crossings_started, 1);
        assert!(eventually(|| x.is_child()).await);
        assert!(eventually(|| !p.a.border().is_crossing(&x.id())).await);

        // A child is never handed off again.
        assert_eq!(p.a.tick().crossings_started, 0);
        let stats = p.a.stats();
        assert_eq!(stats.root_presences, 0);
        assert_eq!(stats.child_presences, 1);
        assert_eq!(p.b.stats().root_presences, 1);
    }

    #[tokio::test]
    async fn failed_crossing_is_throttled() {
        let p = pair();
        p.connector_b.refuse_all();
        let (x, _) = login(&p.a, at(262.0, 128.0));

        assert_eq!(p.a.tick().crossings_started, 1);
        assert!(eventually(|| !p.a.border().is_crossing(&x.id())).await);
        assert!(x.is_root());

        assert_eq!(p.a.tick().crossings_started, 0);
        assert_eq!(p.transport.count(capabilities::REZ_AVATAR_REQUEST), 1);
    }

    #[tokio::test]
    async fn throttle_expires_after_cooldown() {
        let p = pair_with(|c| c.crossing_cooldown_ms = 20);
        p.connector_b.refuse_all();
        let (x, _) = login(&p.a, at(262.0, 128.0));

        assert_eq!(p.a.tick().crossings_started, 1);
        assert!(eventually(|| !p.a.border().is_crossing(&x.id())).await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!p.a.border().is_throttled(&x.id(), Instant::now()));
        assert_eq!(p.a.tick().crossings_started, 1);
    }

    #[tokio::test]
    async fn removed_agent_leaves_no_retry_state() {
        let p = pair();
        p.connector_b.refuse_all();
        let (x, _) = login(&p.a, at(262.0, 128.0));

        assert_eq!(p.a.tick().crossings_started, 1);
        assert!(eventually(|| !p.a.border().is_crossing(&x.id())).await);
        assert_eq!(p.a.border().throttled_count(), 1);

        assert!(p.a.remove_entity(x.local_id(), x.id()));
        assert_eq!(p.a.border().throttled_count(), 0);
    }

    #[tokio::test]
    async fn tick_sweeps_expired_retry_state() {
        let p = pair_with(|c| c.crossing_cooldown_ms = 20);
        p.connector_b.refuse_all();
        let (x, _) = login(&p.a, at(262.0, 128.0));

        assert_eq!(p.a.tick().crossings_started, 1);
        assert!(eventually(|| !p.a.border().is_crossing(&x.id())).await);
        // Gone from the scene without passing through the service.
        assert!(p.a.scene().remove_entity(x.as_ref()));
        assert_eq!(p.a.border().throttled_count(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        p.a.tick();
        assert_eq!(p.a.border().throttled_count(), 0);
    }

    #[tokio::test]
    async fn objects_past_the_border_stay_put() {
        let p = pair();
        let object = p.a.add_object("crate", at(300.0, 128.0));
        let entity: Arc<dyn SceneEntity> = object.clone();
        p.a.entity_moved(&entity);

        assert!(p.a.scene().try_get_entity(&object.id()).is_some());
        assert!(p.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn moved_presence_hook_starts_crossing() {
        let p = pair();
        let (x, _) = login(&p.a, at(128.0, 128.0));
        x.set_relative_position(at(270.0, 128.0));
        let entity: Arc<dyn SceneEntity> = x.clone();
        p.a.entity_moved(&entity);
        assert!(eventually(|| x.is_child()).await);
    }
}
