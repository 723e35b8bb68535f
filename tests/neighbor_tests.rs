//! Neighbor announcements, capability learning, child presence streaming
//! and the inbound rez handler.

mod common;

#[cfg(test)]
mod tests {
    use crate::common::{at, eventually, pair, pair_with, RecordingChannel};
    use region_sim::protocol::{capabilities, ChildAvatarUpdate, RezAvatarRequest, RezAvatarResponse};
    use region_sim::{Camera, Quat, SceneEntity, Vec3};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    fn child_update(agent_id: Uuid, source: Uuid, position: Vec3) -> Vec<u8> {
        let msg = ChildAvatarUpdate {
            agent_id,
            position,
            rotation: Quat::IDENTITY,
            camera_center: position,
            camera_at: Vec3::new(1.0, 0.0, 0.0),
            camera_left: Vec3::new(0.0, 1.0, 0.0),
            camera_up: Vec3::new(0.0, 0.0, 1.0),
            draw_distance: 128.0,
            source_region_id: Some(source),
        };
        serde_json::to_vec(&msg).unwrap()
    }

    fn rez_request(agent_id: Uuid, session_id: Uuid, child: bool) -> Vec<u8> {
        serde_json::to_vec(&RezAvatarRequest {
            agent_id,
            session_id,
            position: at(10.0, 20.0),
            look_at: Vec3::new(0.0, 1.0, 0.0),
            velocity: Vec3::new(2.0, 0.0, 0.0),
            child,
            source_region_id: None,
        })
        .unwrap()
    }

    // -----------------------------------------------------------------------
    // Online / offline
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn online_announcement_links_both_regions() {
        let p = pair();
        assert_eq!(p.a.neighbors().announce_online().await, 1);

        assert_eq!(p.a.neighbors().neighbor_count(), 1);
        let seen_by_b = p.b.neighbors().neighbor(&p.a.config().region_id).unwrap();
        assert_eq!(seen_by_b.name, "A");
        assert_eq!(seen_by_b.public_seed_capability, "http://a/caps/seed");
        assert_eq!(p.b.stats().neighbors, 1);
    }

    #[tokio::test]
    async fn capabilities_are_learned_once() {
        let p = pair();
        p.a.neighbors().announce_online().await;
        p.a.neighbors().announce_offline().await;
        assert_eq!(p.transport.count(capabilities::SEED), 1);
        assert_eq!(p.transport.count(capabilities::REGION_ONLINE), 1);
        assert_eq!(p.transport.count(capabilities::REGION_OFFLINE), 1);
    }

    #[tokio::test]
    async fn unreachable_neighbor_does_not_block_startup() {
        let p = pair();
        p.transport.fail_verb(capabilities::REGION_ONLINE);
        assert_eq!(p.a.neighbors().announce_online().await, 0);
        assert_eq!(p.a.neighbors().neighbor_count(), 0);
        assert_eq!(p.b.neighbors().neighbor_count(), 0);
    }

    #[tokio::test]
    async fn offline_drops_neighbor_and_its_children() {
        let p = pair();
        p.b.neighbors().announce_online().await;
        assert_eq!(p.a.neighbors().neighbor_count(), 1);

        let agent = Uuid::new_v4();
        let reply = p.a.handle_message(
            capabilities::CHILD_AVATAR_UPDATE,
            &child_update(agent, p.b.config().region_id, at(250.0, 128.0)),
        );
        assert!(reply.is_success());
        assert_eq!(p.a.stats().child_presences, 1);

        assert_eq!(p.b.neighbors().announce_offline().await, 1);
        assert_eq!(p.a.neighbors().neighbor_count(), 0);
        assert!(p.a.scene().try_get_presence(&agent).is_none());
        assert_eq!(p.b.neighbors().neighbor_count(), 0);
    }

    // -----------------------------------------------------------------------
    // Child presence streaming
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn camera_movement_streams_child_update_in_neighbor_frame() {
        let p = pair();
        p.a.neighbors().announce_online().await;

        let agent = Uuid::new_v4();
        let x = p.a.add_presence(
            agent,
            Uuid::new_v4(),
            "Streamer",
            at(250.0, 128.0),
            Arc::new(RecordingChannel::default()),
        );
        assert!(p.a.neighbors().queue_child_update(&x));
        assert!(!p.a.neighbors().queue_child_update(&x), "camera has not moved");
        assert_eq!(p.a.neighbors().pending_child_updates(), 1);

        p.a.neighbors().shutdown();
        assert!(eventually(|| p.b.scene().try_get_presence(&agent).is_some()).await);

        let child = p.b.scene().try_get_presence(&agent).unwrap();
        assert!(child.is_child());
        assert_eq!(child.origin_region(), Some(p.a.config().region_id));
        assert_eq!(child.scene_position(), Vec3::new(-6.0, 128.0, 25.0));
        assert_eq!(child.camera().center, Vec3::new(-6.0, 128.0, 25.0));
    }

    #[tokio::test]
    async fn updates_coalesce_per_presence() {
        let p = pair();
        p.a.neighbors().announce_online().await;
        let x = p.a.add_presence(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Runner",
            at(200.0, 128.0),
            Arc::new(RecordingChannel::default()),
        );
        assert!(p.a.neighbors().queue_child_update(&x));
        let mut camera: Camera = x.camera();
        camera.center = at(240.0, 128.0);
        x.set_camera(camera);
        assert!(p.a.neighbors().queue_child_update(&x));
        assert_eq!(p.a.neighbors().pending_child_updates(), 1);
    }

    #[tokio::test]
    async fn neighbors_out_of_draw_distance_get_nothing() {
        let p = pair();
        p.a.neighbors().announce_online().await;

        let agent = Uuid::new_v4();
        let x = p.a.add_presence(
            agent,
            Uuid::new_v4(),
            "Homebody",
            at(10.0, 128.0),
            Arc::new(RecordingChannel::default()),
        );
        let mut camera = x.camera();
        camera.draw_distance = 64.0;
        x.set_camera(camera);

        assert!(p.a.neighbors().queue_child_update(&x));
        p.a.neighbors().shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(p.transport.count(capabilities::CHILD_AVATAR_UPDATE), 0);
        assert!(p.b.scene().try_get_presence(&agent).is_none());
    }

    #[test]
    fn child_updates_need_a_neighbor() {
        let p = pair();
        let x = p.a.add_presence(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Alone",
            at(250.0, 128.0),
            Arc::new(RecordingChannel::default()),
        );
        assert!(!p.a.neighbors().queue_child_update(&x));
    }

    #[test]
    fn stale_children_expire() {
        let p = pair();
        let agent = Uuid::new_v4();
        p.a.handle_message(
            capabilities::CHILD_AVATAR_UPDATE,
            &child_update(agent, p.b.config().region_id, at(250.0, 128.0)),
        );

        let now = Instant::now();
        assert_eq!(p.a.neighbors().expire_children(now), 0);
        assert_eq!(
            p.a.neighbors()
                .expire_children(now + Duration::from_secs(61)),
            1
        );
        assert!(p.a.scene().try_get_presence(&agent).is_none());
    }

    #[test]
    fn concurrent_child_updates_create_one_presence() {
        let p = pair();
        let source = p.b.config().region_id;
        for round in 0..300 {
            let agent = Uuid::new_v4();
            let body = child_update(agent, source, at(250.0, 128.0));
            let barrier = Barrier::new(4);
            let failures = AtomicUsize::new(0);
            std::thread::scope(|s| {
                for _ in 0..4 {
                    s.spawn(|| {
                        barrier.wait();
                        let reply = catch_unwind(AssertUnwindSafe(|| {
                            p.a.handle_message(capabilities::CHILD_AVATAR_UPDATE, &body)
                        }));
                        if !matches!(reply, Ok(ref r) if r.is_success()) {
                            failures.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                }
            });
            assert_eq!(failures.load(Ordering::SeqCst), 0, "round {round}");
            assert!(p.a.scene().try_get_presence(&agent).is_some());
        }
        let stats = p.a.stats();
        assert_eq!(stats.child_presences, 300);
        assert_eq!(stats.entities, 300);
    }

    // -----------------------------------------------------------------------
    // Inbound rez
    // -----------------------------------------------------------------------

    #[test]
    fn rez_racing_child_updates_leaves_one_root() {
        let p = pair();
        let source = p.a.config().region_id;
        for _ in 0..100 {
            let agent = Uuid::new_v4();
            let session = Uuid::new_v4();
            let update = child_update(agent, source, at(-6.0, 128.0));
            let rez = rez_request(agent, session, false);
            let barrier = Barrier::new(4);
            std::thread::scope(|s| {
                for i in 0..4 {
                    let (barrier, update, rez) = (&barrier, &update, &rez);
                    let region = &p.b;
                    s.spawn(move || {
                        barrier.wait();
                        let body = if i == 0 { rez } else { update };
                        let verb = if i == 0 {
                            capabilities::REZ_AVATAR_REQUEST
                        } else {
                            capabilities::CHILD_AVATAR_UPDATE
                        };
                        assert!(region.handle_message(verb, body).is_success());
                    });
                }
            });
            let presence = p.b.scene().try_get_presence(&agent).unwrap();
            assert!(presence.is_root());
            assert_eq!(presence.session_id(), session);
        }
        let stats = p.b.stats();
        assert_eq!(stats.root_presences, 100);
        assert_eq!(stats.child_presences, 0);
        assert_eq!(stats.entities, 100);
    }

    #[test]
    fn rez_creates_root_presence_with_client_channel() {
        let p = pair();
        let agent = Uuid::new_v4();
        let session = Uuid::new_v4();
        let reply = p.b.handle_message(
            capabilities::REZ_AVATAR_REQUEST,
            &rez_request(agent, session, false),
        );
        assert!(reply.is_success());
        let response: RezAvatarResponse = serde_json::from_value(reply.body).unwrap();
        assert!(response.connect);
        assert_eq!(response.region_id, Some(p.b.config().region_id));
        assert_eq!(response.region_x, Some(256.0));
        assert_eq!(
            response.region_seed_capability.as_deref(),
            Some("http://b/caps/seed")
        );

        let presence = p.b.scene().try_get_presence(&agent).unwrap();
        assert!(presence.is_root());
        assert_eq!(presence.scene_position(), at(10.0, 20.0));
        assert!(p.connector_b.channel(&agent).is_some());
    }

    #[test]
    fn repeated_rez_is_idempotent_for_same_session() {
        let p = pair();
        let agent = Uuid::new_v4();
        let session = Uuid::new_v4();
        let body = rez_request(agent, session, false);
        assert!(p.b.handle_message(capabilities::REZ_AVATAR_REQUEST, &body).is_success());
        assert!(p.b.handle_message(capabilities::REZ_AVATAR_REQUEST, &body).is_success());
        assert_eq!(p.b.stats().root_presences, 1);

        let hijack = rez_request(agent, Uuid::new_v4(), false);
        assert_eq!(
            p.b.handle_message(capabilities::REZ_AVATAR_REQUEST, &hijack).status,
            403
        );
    }

    #[test]
    fn rez_upgrades_child_placeholder() {
        let p = pair();
        let agent = Uuid::new_v4();
        p.b.handle_message(
            capabilities::CHILD_AVATAR_UPDATE,
            &child_update(agent, p.a.config().region_id, at(-6.0, 128.0)),
        );
        assert_eq!(p.b.stats().child_presences, 1);

        let reply = p.b.handle_message(
            capabilities::REZ_AVATAR_REQUEST,
            &rez_request(agent, Uuid::new_v4(), false),
        );
        assert!(reply.is_success());
        let stats = p.b.stats();
        assert_eq!(stats.child_presences, 0);
        assert_eq!(stats.root_presences, 1);
        assert_eq!(stats.entities, 1);
    }

    #[test]
    fn child_rez_records_origin() {
        let p = pair_with(|_| {});
        let agent = Uuid::new_v4();
        let source = p.a.config().region_id;
        let body = serde_json::to_vec(&RezAvatarRequest {
            agent_id: agent,
            session_id: Uuid::new_v4(),
            position: at(-3.0, 50.0),
            look_at: Vec3::new(1.0, 0.0, 0.0),
            velocity: Vec3::zero(),
            child: true,
            source_region_id: Some(source),
        })
        .unwrap();
        assert!(p.b.handle_message(capabilities::REZ_AVATAR_REQUEST, &body).is_success());
        let child = p.b.scene().try_get_presence(&agent).unwrap();
        assert!(child.is_child());
        assert_eq!(child.origin_region(), Some(source));
    }
}
