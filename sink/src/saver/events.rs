use replay_core::messages::{ClickEvent, CustomEvent, FetchEvent, GraphQlEvent, InputEvent, PageEvent};
use replay_core::url::{discard_query, ensure_method, url_parts};

use super::{Saver, seq_index};
use crate::error::PipelineError;
use crate::search::SearchIndexer;
use crate::store::{SqlParam, Statement, Store};

const PAGE_SQL: &str = r#"
    INSERT INTO events.pages (
        session_id, message_id, timestamp, referrer, base_referrer, host, path, query,
        dom_content_loaded_time, load_time, response_end, first_paint_time,
        first_contentful_paint_time, speed_index, visually_complete, time_to_interactive,
        response_time, dom_building_time
    ) VALUES (
        $1, $2, $3, NULLIF($4, ''), NULLIF($5, ''), $6, $7, $8,
        NULLIF($9, 0), NULLIF($10, 0), NULLIF($11, 0), NULLIF($12, 0),
        NULLIF($13, 0), NULLIF($14, 0), NULLIF($15, 0), NULLIF($16, 0),
        NULLIF($17, 0), NULLIF($18, 0)
    ) ON CONFLICT DO NOTHING
"#;

const REFERRER_SQL: &str = r#"
    UPDATE sessions SET referrer = $1, base_referrer = $2
    WHERE session_id = $3 AND referrer IS NULL
"#;

const CLICK_SQL: &str = r#"
    INSERT INTO events.clicks (session_id, message_id, timestamp, label, selector, url)
    (SELECT $1, $2, $3, NULLIF($4, ''), $5, host || path
        FROM events.pages
        WHERE session_id = $1 AND timestamp <= $3
        ORDER BY timestamp DESC LIMIT 1)
"#;

const INPUT_SQL: &str = r#"
    INSERT INTO events.inputs (session_id, message_id, timestamp, value, label)
    VALUES ($1, $2, $3, $4, NULLIF($5, ''))
    ON CONFLICT DO NOTHING
"#;

const REQUEST_SQL: &str = r#"
    INSERT INTO events_common.requests (
        session_id, timestamp, seq_index,
        url, host, path, query,
        request_body, response_body, status_code, method,
        duration, success
    ) VALUES (
        $1, $2, $3,
        left($4, 2700), $5, $6, $7,
        $8, $9, $10::smallint, NULLIF($11, '')::http_method,
        $12, $13
    ) ON CONFLICT DO NOTHING
"#;

const GRAPHQL_SQL: &str = r#"
    INSERT INTO events.graphql (session_id, timestamp, message_id, name, request_body, response_body)
    VALUES ($1, $2, $3, left($4, 2700), $5, $6)
    ON CONFLICT DO NOTHING
"#;

const CUSTOM_SQL: &str = r#"
    INSERT INTO events_common.customs (session_id, timestamp, seq_index, name, payload)
    VALUES ($1, $2, $3, left($4, 2700), $5)
    ON CONFLICT DO NOTHING
"#;

impl<S: Store, I: SearchIndexer> Saver<S, I> {
    pub(super) async fn page(&self, session_id: u64, page: &PageEvent) -> Result<(), PipelineError> {
        let session = self.cache.get_session(session_id).await?;
        let parts = url_parts(&page.url).map_err(|err| PipelineError::Validation {
            field: "url",
            message: err.to_string(),
        })?;

        let base_referrer = discard_query(&page.referrer);
        self.queue(
            session_id,
            Statement::new(
                PAGE_SQL,
                vec![
                    SqlParam::uint(session_id),
                    SqlParam::uint(page.message_id),
                    SqlParam::uint(page.timestamp),
                    SqlParam::text(page.referrer.as_str()),
                    SqlParam::text(base_referrer),
                    SqlParam::text(parts.host),
                    SqlParam::text(parts.path.as_str()),
                    SqlParam::Text(parts.query),
                    SqlParam::uint(page.dom_content_loaded_event_end),
                    SqlParam::uint(page.load_event_end),
                    SqlParam::uint(page.response_end),
                    SqlParam::uint(page.first_paint),
                    SqlParam::uint(page.first_contentful_paint),
                    SqlParam::uint(page.speed_index),
                    SqlParam::uint(page.visually_complete),
                    SqlParam::uint(page.time_to_interactive),
                    SqlParam::uint(page.response_time()),
                    SqlParam::uint(page.dom_building_time()),
                ],
            ),
        )
        .await;

        if !page.referrer.is_empty() && session.referrer.is_none() {
            self.queue(
                session_id,
                Statement::new(
                    REFERRER_SQL,
                    vec![
                        SqlParam::text(page.referrer.as_str()),
                        SqlParam::text(base_referrer),
                        SqlParam::uint(session_id),
                    ],
                ),
            )
            .await;
        }

        self.batches.record_session_events(session_id, 1, 1);
        self.cache
            .update_session(session_id, |s| {
                s.add_events(1, 1);
                if s.referrer.is_none() && !page.referrer.is_empty() {
                    s.referrer = Some(page.referrer.clone());
                }
            })
            .await?;

        self.autocomplete(session_id, session.project_id, "LOCATION", discard_query(&parts.path))
            .await;
        self.autocomplete(session_id, session.project_id, "REFERRER", base_referrer)
            .await;
        Ok(())
    }

    pub(super) async fn click(&self, session_id: u64, click: &ClickEvent) -> Result<(), PipelineError> {
        let session = self.cache.get_session(session_id).await?;
        self.queue(
            session_id,
            Statement::new(
                CLICK_SQL,
                vec![
                    SqlParam::uint(session_id),
                    SqlParam::uint(click.message_id),
                    SqlParam::uint(click.timestamp),
                    SqlParam::text(click.label.as_str()),
                    SqlParam::text(click.selector.as_str()),
                ],
            ),
        )
        .await;
        self.count_event(session_id).await?;
        self.autocomplete(session_id, session.project_id, "CLICK", &click.label)
            .await;
        Ok(())
    }

    pub(super) async fn input(&self, session_id: u64, input: &InputEvent) -> Result<(), PipelineError> {
        let session = self.cache.get_session(session_id).await?;
        if input.label.is_empty() {
            return Ok(());
        }
        let value = if input.value_masked {
            SqlParam::null()
        } else {
            SqlParam::text(input.value.as_str())
        };
        self.queue(
            session_id,
            Statement::new(
                INPUT_SQL,
                vec![
                    SqlParam::uint(session_id),
                    SqlParam::uint(input.message_id),
                    SqlParam::uint(input.timestamp),
                    value,
                    SqlParam::text(input.label.as_str()),
                ],
            ),
        )
        .await;
        self.count_event(session_id).await?;
        self.autocomplete(session_id, session.project_id, "INPUT", &input.label)
            .await;
        Ok(())
    }

    pub(super) async fn fetch(&self, session_id: u64, fetch: &FetchEvent) -> Result<(), PipelineError> {
        let session = self.cache.get_session(session_id).await?;
        let parts = url_parts(&fetch.url).map_err(|err| PipelineError::Validation {
            field: "url",
            message: err.to_string(),
        })?;
        let method = ensure_method(&fetch.method);

        let (request, response) = if session.save_request_payload {
            (
                SqlParam::text(fetch.request.as_str()),
                SqlParam::text(fetch.response.as_str()),
            )
        } else {
            (SqlParam::null(), SqlParam::null())
        };

        // Bodies count toward the batch size even when they are not stored.
        let size = REQUEST_SQL.len()
            + fetch.url.len()
            + parts.host.len()
            + parts.path.len()
            + parts.query.as_deref().map_or(0, str::len)
            + fetch.request.len()
            + fetch.response.len()
            + method.len()
            + 8 * 5
            + 1;

        self.autocomplete(session_id, session.project_id, "REQUEST", &parts.path)
            .await;
        self.queue_sized(
            session_id,
            Statement::new(
                REQUEST_SQL,
                vec![
                    SqlParam::uint(session_id),
                    SqlParam::uint(fetch.timestamp),
                    seq_index(fetch.message_id),
                    SqlParam::text(fetch.url.as_str()),
                    SqlParam::text(parts.host),
                    SqlParam::text(parts.path),
                    SqlParam::Text(parts.query),
                    request,
                    response,
                    SqlParam::uint(fetch.status),
                    SqlParam::text(method),
                    SqlParam::uint(fetch.duration),
                    SqlParam::Bool(fetch.status < 400),
                ],
            ),
            size,
        )
        .await;
        Ok(())
    }

    pub(super) async fn graphql(&self, session_id: u64, graphql: &GraphQlEvent) -> Result<(), PipelineError> {
        let session = self.cache.get_session(session_id).await?;
        let (request, response) = if session.save_request_payload {
            (
                SqlParam::text(graphql.variables.as_str()),
                SqlParam::text(graphql.response.as_str()),
            )
        } else {
            (SqlParam::null(), SqlParam::null())
        };
        self.queue(
            session_id,
            Statement::new(
                GRAPHQL_SQL,
                vec![
                    SqlParam::uint(session_id),
                    SqlParam::uint(graphql.timestamp),
                    SqlParam::uint(graphql.message_id),
                    SqlParam::text(graphql.operation_name.as_str()),
                    request,
                    response,
                ],
            ),
        )
        .await;
        self.autocomplete(session_id, session.project_id, "GRAPHQL", &graphql.operation_name)
            .await;
        Ok(())
    }

    pub(super) async fn custom(&self, session_id: u64, custom: &CustomEvent) -> Result<(), PipelineError> {
        let session = self.cache.get_session(session_id).await?;
        self.queue(
            session_id,
            Statement::new(
                CUSTOM_SQL,
                vec![
                    SqlParam::uint(session_id),
                    SqlParam::uint(custom.timestamp),
                    seq_index(custom.message_id),
                    SqlParam::text(custom.name.as_str()),
                    SqlParam::text(custom.payload.as_str()),
                ],
            ),
        )
        .await;
        self.autocomplete(session_id, session.project_id, "CUSTOM", &custom.name)
            .await;
        Ok(())
    }

    async fn count_event(&self, session_id: u64) -> Result<(), PipelineError> {
        self.batches.record_session_events(session_id, 0, 1);
        self.cache
            .update_session(session_id, |s| s.add_events(0, 1))
            .await
    }
}

#[cfg(test)]
mod tests {
    use replay_core::messages::{ClickEvent, FetchEvent, GraphQlEvent, InputEvent, Message, PageEvent};

    use crate::batch::BatchLimits;
    use crate::error::PipelineError;
    use crate::saver::testing::{Harness, harness, harness_with_limits, project, start};
    use crate::store::{SqlParam, Statement};

    async fn started(save_payloads: bool) -> Harness {
        let h = harness(project(7, save_payloads));
        h.saver
            .route(42, &Message::SessionStart(start(7, 1_000)))
            .await
            .unwrap();
        h
    }

    async fn flushed(h: &Harness, fragment: &str) -> Vec<Statement> {
        h.batches.flush_all().await.unwrap();
        h.store
            .executed()
            .into_iter()
            .filter(|s| s.sql.contains(fragment))
            .collect()
    }

    fn fetch(status: u64) -> FetchEvent {
        FetchEvent {
            message_id: 9,
            timestamp: 2_000,
            method: "post".to_string(),
            url: "https://api.example.com/v1/cart?id=3".to_string(),
            request: "{\"id\":3}".to_string(),
            response: "{\"ok\":true}".to_string(),
            status,
            duration: 120,
        }
    }

    #[tokio::test]
    async fn page_event_counts_and_sets_first_referrer() {
        let h = started(false).await;
        let page = |id: u64, referrer: &str| {
            Message::PageEvent(PageEvent {
                message_id: id,
                timestamp: 1_500 + id,
                url: "https://app.example.com/pricing?plan=pro".to_string(),
                referrer: referrer.to_string(),
                response_start: 100,
                response_end: 150,
                ..PageEvent::default()
            })
        };
        h.saver.route(42, &page(1, "https://google.com/?q=x")).await.unwrap();
        h.saver.route(42, &page(2, "https://bing.com/")).await.unwrap();

        let session = h.cache.get_session(42).await.unwrap();
        assert_eq!(session.pages_count, 2);
        assert_eq!(session.events_count, 2);
        assert_eq!(session.referrer.as_deref(), Some("https://google.com/?q=x"));

        let pages = flushed(&h, "events.pages").await;
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].params[5], SqlParam::text("app.example.com"));
        assert_eq!(pages[0].params[6], SqlParam::text("/pricing"));
        assert_eq!(pages[0].params[7], SqlParam::text("plan=pro"));
        assert_eq!(pages[0].params[16], SqlParam::Int(50));

        let referrer_updates: Vec<Statement> = h
            .store
            .executed()
            .into_iter()
            .filter(|s| s.sql.contains("SET referrer"))
            .collect();
        assert_eq!(referrer_updates.len(), 1);
        assert_eq!(referrer_updates[0].params[1], SqlParam::text("https://google.com/"));
    }

    #[tokio::test]
    async fn malformed_page_url_is_a_validation_error() {
        let h = started(false).await;
        let err = h
            .saver
            .route(42, &Message::PageEvent(PageEvent {
                url: "http://[::1".to_string(),
                ..PageEvent::default()
            }))
            .await
            .unwrap_err();
        match err {
            PipelineError::Validation { field: "url", .. } => {}
            other => panic!("unexpected error variant: {:?}", other),
        }
        assert_eq!(h.cache.get_session(42).await.unwrap().pages_count, 0);
    }

    #[tokio::test]
    async fn empty_input_label_is_ignored_and_masked_value_is_null() {
        let h = started(false).await;
        h.saver
            .route(42, &Message::InputEvent(InputEvent {
                message_id: 1,
                timestamp: 1_100,
                label: String::new(),
                value: "secret".to_string(),
                value_masked: false,
            }))
            .await
            .unwrap();
        h.saver
            .route(42, &Message::InputEvent(InputEvent {
                message_id: 2,
                timestamp: 1_200,
                label: "password".to_string(),
                value: "hunter2".to_string(),
                value_masked: true,
            }))
            .await
            .unwrap();

        assert_eq!(h.cache.get_session(42).await.unwrap().events_count, 1);
        let inputs = flushed(&h, "events.inputs").await;
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].params[3], SqlParam::null());
    }

    #[tokio::test]
    async fn click_counts_event_without_page() {
        let h = started(false).await;
        h.saver
            .route(42, &Message::ClickEvent(ClickEvent {
                message_id: 1,
                timestamp: 1_100,
                label: "Buy".to_string(),
                selector: "#buy".to_string(),
            }))
            .await
            .unwrap();

        let session = h.cache.get_session(42).await.unwrap();
        assert_eq!(session.events_count, 1);
        assert_eq!(session.pages_count, 0);
        assert_eq!(flushed(&h, "events.clicks").await.len(), 1);
    }

    #[tokio::test]
    async fn fetch_bodies_are_kept_only_when_project_saves_payloads() {
        let h = started(false).await;
        h.saver.route(42, &Message::FetchEvent(fetch(200))).await.unwrap();
        let requests = flushed(&h, "events_common.requests").await;
        assert_eq!(requests[0].params[7], SqlParam::null());
        assert_eq!(requests[0].params[8], SqlParam::null());
        assert_eq!(requests[0].params[10], SqlParam::text("POST"));
        assert_eq!(requests[0].params[12], SqlParam::Bool(true));

        let h = started(true).await;
        h.saver.route(42, &Message::FetchEvent(fetch(500))).await.unwrap();
        let requests = flushed(&h, "events_common.requests").await;
        assert_eq!(requests[0].params[7], SqlParam::text("{\"id\":3}"));
        assert_eq!(requests[0].params[12], SqlParam::Bool(false));
    }

    #[tokio::test]
    async fn graphql_bodies_follow_payload_flag() {
        let h = started(true).await;
        h.saver
            .route(42, &Message::GraphQlEvent(GraphQlEvent {
                message_id: 4,
                timestamp: 1_600,
                operation_kind: "query".to_string(),
                operation_name: "Me".to_string(),
                variables: "{}".to_string(),
                response: "{\"me\":null}".to_string(),
            }))
            .await
            .unwrap();
        let rows = flushed(&h, "events.graphql").await;
        assert_eq!(rows[0].params[5], SqlParam::text("{\"me\":null}"));
    }

    #[tokio::test]
    async fn oversized_batch_is_flushed_before_the_tick() {
        let h = harness_with_limits(
            project(7, false),
            BatchLimits {
                size_limit: 1_500,
                ..BatchLimits::default()
            },
        );
        h.saver
            .route(42, &Message::SessionStart(start(7, 1_000)))
            .await
            .unwrap();
        assert!(h.store.executed().is_empty());

        h.saver.route(42, &Message::FetchEvent(fetch(200))).await.unwrap();
        h.saver.route(42, &Message::FetchEvent(fetch(201))).await.unwrap();
        assert!(!h.store.executed().is_empty());
    }
}
