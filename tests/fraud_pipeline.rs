//! Integration specifications for the fraud attribution pipeline.
//!
//! Scenarios exercise the public surface end to end: evidence capture,
//! checkout evaluation, the admin workflow, and the HTTP router, without
//! reaching into private modules.

mod common {
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};

    use clickguard::engine::{
        engine_router, CaptureRequest, ConfigStore, EngineState, EngagementSummary,
        EvaluationService, EvidenceCapture, InMemoryAttributionRepository,
        InMemoryConfigRepository, InMemoryEvaluationRepository, InMemorySessionDirectory,
        SessionRecord,
    };

    pub(super) type Service = EvaluationService<
        InMemoryAttributionRepository,
        InMemorySessionDirectory,
        InMemoryEvaluationRepository,
        InMemoryConfigRepository,
    >;

    pub(super) struct Pipeline {
        pub(super) capture: Arc<
            EvidenceCapture<InMemoryAttributionRepository, InMemoryConfigRepository>,
        >,
        pub(super) service: Arc<Service>,
        pub(super) directory: Arc<InMemorySessionDirectory>,
        pub(super) evaluations: Arc<InMemoryEvaluationRepository>,
    }

    impl Pipeline {
        pub(super) fn router(&self) -> axum::Router {
            engine_router(Arc::new(EngineState {
                service: self.service.clone(),
                capture: self.capture.clone(),
            }))
        }
    }

    pub(super) fn pipeline() -> Pipeline {
        let attribution = Arc::new(InMemoryAttributionRepository::default());
        let directory = Arc::new(InMemorySessionDirectory::default());
        let evaluations = Arc::new(InMemoryEvaluationRepository::default());
        let config_store = Arc::new(ConfigStore::new(Arc::new(
            InMemoryConfigRepository::default(),
        )));

        let service = Arc::new(EvaluationService::new(
            attribution.clone(),
            directory.clone(),
            evaluations.clone(),
            config_store.clone(),
            None,
        ));
        let capture = Arc::new(EvidenceCapture::new(
            attribution,
            config_store,
            "integration-salt".to_string(),
        ));

        Pipeline {
            capture,
            service,
            directory,
            evaluations,
        }
    }

    pub(super) fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 14, hour, minute, 0).unwrap()
    }

    pub(super) fn affiliate_page_view(session_id: &str) -> CaptureRequest {
        CaptureRequest {
            session_id: session_id.to_string(),
            visitor_id: Some("visitor-9".to_string()),
            entry_url: Some(
                "https://shop.example/landing?irclickid=click-123&aff_id=partner7\
                 &utm_source=partner&utm_medium=affiliate&utm_campaign=summer"
                    .to_string(),
            ),
            referrer: Some("https://partner.example/deals".to_string()),
            current_url: None,
            client_ip: Some("203.0.113.9".to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
        }
    }

    /// A session claiming affiliate credit through its medium while also
    /// carrying a Google Ads click id; scores past the default threshold.
    pub(super) fn conflicted_page_view(session_id: &str) -> CaptureRequest {
        CaptureRequest {
            session_id: session_id.to_string(),
            visitor_id: None,
            entry_url: Some(
                "https://shop.example/landing?gclid=ads-42&utm_medium=affiliate".to_string(),
            ),
            referrer: None,
            current_url: None,
            client_ip: Some("198.51.100.4".to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
        }
    }

    pub(super) fn seed_engaged_session(pipeline: &Pipeline, session_id: &str) {
        pipeline.directory.put_session(SessionRecord {
            session_id: session_id.to_string(),
            started_at: Some(at(9, 0)),
            ..SessionRecord::default()
        });
        pipeline.directory.put_engagement(
            session_id,
            EngagementSummary {
                total_events: 14,
                page_views: 6,
                product_views: 4,
                add_to_carts: 1,
                first_event_at: Some(at(9, 0)),
                last_event_at: Some(at(9, 40)),
                checkout_started_at: Some(at(9, 35)),
            },
        );
    }
}

mod capture_scenarios {
    use super::common::*;
    use clickguard::engine::CaptureOutcome;

    #[test]
    fn first_touch_is_recorded_then_rate_limited() {
        let pipeline = pipeline();
        let session = "sess-capture-1";

        let first = pipeline
            .capture
            .capture(affiliate_page_view(session), at(9, 0));
        assert_eq!(first, CaptureOutcome::Inserted);

        // A second request ten seconds later lands inside the update
        // interval and is dropped.
        let mut followup = affiliate_page_view(session);
        followup.current_url =
            Some("https://shop.example/product?clickid=late-9".to_string());
        let second = pipeline.capture.capture(followup, at(9, 0) + chrono::Duration::seconds(10));
        assert_eq!(second, CaptureOutcome::RateLimited);
    }

    #[test]
    fn late_signals_update_after_the_interval() {
        let pipeline = pipeline();
        let session = "sess-capture-2";

        pipeline
            .capture
            .capture(affiliate_page_view(session), at(9, 0));

        let mut followup = affiliate_page_view(session);
        followup.current_url =
            Some("https://shop.example/product?clickid=late-9".to_string());
        let outcome = pipeline.capture.capture(followup, at(9, 5));
        assert_eq!(outcome, CaptureOutcome::Updated);
    }
}

mod evaluation_scenarios {
    use super::common::*;
    use clickguard::engine::{EntityKind, EvaluationRepository, ResolutionStatus, ResolutionUpdate};

    #[tokio::test]
    async fn clean_affiliate_checkout_stays_below_threshold() {
        let pipeline = pipeline();
        let session = "sess-clean";
        seed_engaged_session(&pipeline, session);
        pipeline
            .capture
            .capture(affiliate_page_view(session), at(9, 0));

        let outcome = pipeline.service.evaluate_checkout_completed(
            session,
            clickguard::engine::CheckoutPayload {
                occurred_at: Some(at(9, 45)),
                checkout_token: Some("tok-clean".to_string()),
                order_id: Some("order-clean".to_string()),
                currency: Some("usd".to_string()),
                total: Some(12_500),
            },
            at(9, 45),
        );

        assert!(outcome.ok);
        assert!(!outcome.triggered);

        // Session, purchase, and order rows all exist and agree.
        for (kind, id) in [
            (EntityKind::Session, session),
            (EntityKind::Purchase, "tok-clean"),
            (EntityKind::Order, "order-clean"),
        ] {
            let row = pipeline
                .evaluations
                .fetch(kind, id)
                .expect("fetch works")
                .expect("row exists");
            assert_eq!(row.score, outcome.score);
            assert_eq!(row.links.session_id.as_deref(), Some(session));
        }
    }

    #[tokio::test]
    async fn conflicting_paid_and_affiliate_claims_trigger() {
        let pipeline = pipeline();
        let session = "sess-conflict";
        seed_engaged_session(&pipeline, session);
        pipeline
            .capture
            .capture(conflicted_page_view(session), at(9, 0));

        let outcome = pipeline.service.evaluate_checkout_completed(
            session,
            clickguard::engine::CheckoutPayload {
                occurred_at: Some(at(10, 0)),
                checkout_token: Some("tok-conflict".to_string()),
                order_id: None,
                currency: Some("USD".to_string()),
                total: Some(4_000),
            },
            at(10, 0),
        );

        assert!(outcome.triggered);
        assert!(outcome
            .flags
            .iter()
            .any(|flag| flag.name() == "google_ads_conflict"));
        assert!(outcome
            .flags
            .iter()
            .any(|flag| flag.name() == "no_affiliate_evidence"));
    }

    #[tokio::test]
    async fn unknown_session_is_synthesized_and_still_scored() {
        let pipeline = pipeline();

        let outcome = pipeline.service.evaluate_checkout_completed(
            "sess-ghost",
            clickguard::engine::CheckoutPayload {
                occurred_at: Some(at(11, 0)),
                checkout_token: None,
                order_id: None,
                currency: Some("EUR".to_string()),
                total: Some(900),
            },
            at(11, 0),
        );

        // No captured evidence and no session row still produces a
        // persisted evaluation under the fallback purchase key.
        assert!(outcome.ok);
        let session_row = pipeline
            .evaluations
            .fetch(EntityKind::Session, "sess-ghost")
            .expect("fetch works")
            .expect("row exists");
        assert!(session_row.links.checkout_token.is_none());
    }

    #[tokio::test]
    async fn resolution_survives_re_evaluation() {
        let pipeline = pipeline();
        let session = "sess-resolve";
        seed_engaged_session(&pipeline, session);
        pipeline
            .capture
            .capture(conflicted_page_view(session), at(9, 0));

        let payload = clickguard::engine::CheckoutPayload {
            occurred_at: Some(at(10, 0)),
            checkout_token: Some("tok-resolve".to_string()),
            order_id: None,
            currency: Some("USD".to_string()),
            total: Some(2_000),
        };
        pipeline
            .service
            .evaluate_checkout_completed(session, payload.clone(), at(10, 0));

        pipeline
            .service
            .update_resolution(
                ResolutionUpdate {
                    evaluation_id: None,
                    entity_kind: Some(EntityKind::Purchase),
                    entity_id: Some("tok-resolve".to_string()),
                    status: "approved".to_string(),
                    note: Some("verified with the network".to_string()),
                    resolver: Some("analyst-1".to_string()),
                },
                at(10, 30),
            )
            .expect("resolution applies");

        // The webhook replays; the analyst's decision must hold.
        pipeline
            .service
            .evaluate_checkout_completed(session, payload, at(10, 45));

        let row = pipeline
            .evaluations
            .fetch(EntityKind::Purchase, "tok-resolve")
            .expect("fetch works")
            .expect("row exists");
        assert_eq!(row.resolution.status, ResolutionStatus::Approved);
        assert_eq!(row.resolution.resolver.as_deref(), Some("analyst-1"));
    }
}

mod http_scenarios {
    use super::common::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    fn post(uri: &str, payload: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn ingest_and_markers_round_trip() {
        let pipeline = pipeline();
        let router = pipeline.router();
        seed_engaged_session(&pipeline, "sess-http");

        let response = router
            .clone()
            .oneshot(post(
                "/api/v1/ingest/page-view",
                json!({
                    "session_id": "sess-http",
                    "entry_url": "https://shop.example/landing?gclid=ads-7&utm_medium=affiliate",
                    "client_ip": "198.51.100.7",
                    "user_agent": "Mozilla/5.0"
                }),
            ))
            .await
            .expect("router dispatch");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(response).await["outcome"], json!("inserted"));

        let response = router
            .clone()
            .oneshot(post(
                "/api/v1/ingest/checkout-completed",
                json!({
                    "session_id": "sess-http",
                    "checkout_token": "tok-http",
                    "currency": "USD",
                    "total": 5000
                }),
            ))
            .await
            .expect("router dispatch");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let evaluation = json_body(response).await;
        assert_eq!(evaluation["triggered"], json!(true));

        let response = router
            .clone()
            .oneshot(post(
                "/api/v1/fraud/markers",
                json!({
                    "entity_kind": "purchase",
                    "entity_ids": ["tok-http", "tok-absent"]
                }),
            ))
            .await
            .expect("router dispatch");
        assert_eq!(response.status(), StatusCode::OK);
        let markers = json_body(response).await;
        let markers = markers["markers"].as_array().expect("marker list");
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0]["has_eval"], json!(true));
        assert_eq!(markers[0]["triggered"], json!(true));
        assert_eq!(markers[1]["has_eval"], json!(false));

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/v1/fraud/evaluations/purchase/tok-http")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router dispatch");
        assert_eq!(response.status(), StatusCode::OK);
        let detail = json_body(response).await;
        assert!(detail["evaluation"]["score"].as_u64().is_some());
        assert!(detail["analysis"]["summary"].as_str().is_some());
    }

    #[tokio::test]
    async fn detail_for_missing_entity_is_not_found() {
        let pipeline = pipeline();
        let router = pipeline.router();

        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/v1/fraud/evaluations/order/nope")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router dispatch");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn config_write_rejects_unknown_flags_and_accepts_valid_updates() {
        let pipeline = pipeline();
        let router = pipeline.router();

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/v1/fraud/config")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({
                            "version": 1,
                            "weights": { "velocity_spike": 10 }
                        })
                        .to_string(),
                    ))
                    .expect("request"),
            )
            .await
            .expect("router dispatch");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/v1/fraud/config")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({
                            "version": 1,
                            "threshold": 75
                        })
                        .to_string(),
                    ))
                    .expect("request"),
            )
            .await
            .expect("router dispatch");
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/v1/fraud/config")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router dispatch");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["threshold"], json!(75));
    }

    #[tokio::test]
    async fn resolution_endpoint_validates_status() {
        let pipeline = pipeline();
        let router = pipeline.router();

        let response = router
            .oneshot(post(
                "/api/v1/fraud/resolution",
                json!({
                    "entity_kind": "purchase",
                    "entity_id": "tok-x",
                    "status": "escalated"
                }),
            ))
            .await
            .expect("router dispatch");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
