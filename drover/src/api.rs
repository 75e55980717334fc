// Copyright (C) 2025-2026 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of drover.
//
// drover is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// drover is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with drover.  If not,
// see <http://www.gnu.org/licenses/>.

//! # api
//!
//! The HTTP surface. Every endpoint is POST-with-form and every response carries
//! `Access-Control-Allow-Origin: *`.
//!
//! The data path (`/rec`, `/scores`) authenticates the `(uid, key, group)` triple against the
//! group's secret, then serves locally when this instance owns a shard of the group, and
//! otherwise forwards the request verbatim to a live owner. Forwarded requests carry a
//! `hosts_visited` list; each hop appends itself and never forwards to a host already on it, so
//! a request cannot orbit a confused fleet — it fails 503 instead ("provisioning").
//!
//! Handlers follow the house idiom: a thin outer `async fn` that delegates to a nested function
//! returning `Result` (so the body can use `?`), then maps the error onto a status code.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use axum::{
    extract::{Form, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu};
use tap::Pipe;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error};

use crate::{
    entities::{GroupId, Hostname, ScoreMap},
    groups::Group,
    identity::Identity,
    manager::{Manager, StatsBlob},
    recommender::Status,
};

pub const REC_PATH: &str = "/rec";
pub const SCORES_PATH: &str = "/scores";
pub const GROUP_INFO_PATH: &str = "/info";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unauthorized"))]
    Unauthorized { backtrace: Backtrace },
    #[snafu(display("Error: {text}"))]
    Malformed { text: String },
    #[snafu(display("The param {param} has to be an integer"))]
    NotAnInteger { param: String },
    #[snafu(display("{text}"))]
    Unprocessable { text: String },
    #[snafu(display("Too Many Requests"))]
    TooManyRequests,
    #[snafu(display(
        "The server is provisioning the recommender system, the shard will be available soon, please be patient"
    ))]
    Provisioning,
    #[snafu(display("Internal Server Error"))]
    Internal { text: String },
}

impl Error {
    fn internal(err: impl std::fmt::Display) -> Error {
        Error::Internal {
            text: err.to_string(),
        }
    }

    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            // Opaque on purpose: unknown user, unknown group & bad secret all look alike.
            Error::Unauthorized { .. } => (StatusCode::UNAUTHORIZED, self.to_string()),
            Error::Malformed { .. } => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::NotAnInteger { .. } | Error::Unprocessable { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            Error::TooManyRequests => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            Error::Provisioning => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            Error::Internal { text } => {
                error!(%text, "internal error serving a request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_owned(),
                )
            }
        }
    }
}

/// The standard JSON error body.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorRsp {
    pub error: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, msg) = self.as_status_and_msg();
        (status, Json(ErrorRsp { error: msg })).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

pub fn make_router(manager: Arc<Manager>) -> Router {
    Router::new()
        .route(REC_PATH, post(rec))
        .route(SCORES_PATH, post(scores))
        .route(GROUP_INFO_PATH, post(info))
        .route("/add_group", post(add_group))
        .route("/set_shards_group", post(set_shards_group))
        .route("/generate_group_key", post(generate_group_key))
        .route("/get_groups_by_user", post(get_groups_by_user))
        .route("/del_group", post(del_group))
        .route("/remove_group_shards_content", post(remove_content))
        // the misspelling is a published interface by now; leave it be
        .route("/check_healty", get(health).post(health))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(manager)
}

async fn health() -> &'static str {
    "OK"
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     shared request plumbing                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The data-path form: `/rec` and `/scores` share it, and it is what gets forwarded hop to hop.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DataForm {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub group: String,
    pub id: Option<String>,
    pub scores: Option<String>,
    pub items: Option<String>,
    pub max_recs: Option<String>,
    pub insert: Option<String>,
    pub hosts_visited: Option<String>,
    pub fw: Option<String>,
}

/// The group-admin form. `u`/`uk` are the *user's* credentials (checked with the identity
/// collaborator); `k` is the group secret where the operation touches an existing group.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AdminForm {
    #[serde(default)]
    pub u: String,
    #[serde(default)]
    pub uk: String,
    pub g: Option<String>,
    pub k: Option<String>,
    pub guid: Option<String>,
    pub gt: Option<String>,
    pub shards: Option<String>,
    pub maxscore: Option<String>,
    pub s: Option<String>,
}

fn auth_group(manager: &Manager, form: &DataForm) -> Result<Group> {
    manager
        .groups()
        .authenticate(&form.uid, &form.key, &form.group)
        .map_err(|_| UnauthorizedSnafu.build())
}

async fn auth_user(manager: &Manager, user: &str, key: &str) -> Result<Identity> {
    manager
        .identity()
        .identity_for(user, key)
        .await
        .map_err(Error::internal)?
        .ok_or_else(|| UnauthorizedSnafu.build())
}

fn parse_u64(value: Option<&String>, param: &str) -> Result<u64> {
    value
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::NotAnInteger {
            param: param.to_owned(),
        })
}

/// Decode a `{"item": score}` JSON object. A body that isn't JSON is malformed (400); JSON whose
/// keys aren't integers is well-formed but invalid (422).
fn parse_score_map(raw: &str) -> Result<ScoreMap> {
    let by_name: HashMap<String, u8> = serde_json::from_str(raw).map_err(|err| Error::Malformed {
        text: err.to_string(),
    })?;
    by_name
        .into_iter()
        .map(|(k, v)| {
            k.parse::<u64>()
                .map(|item| (item, v))
                .map_err(|_| Error::Unprocessable {
                    text: format!("item id {:?} is not an integer", k),
                })
        })
        .collect()
}

fn parse_item_list(raw: &str) -> Result<Vec<u64>> {
    serde_json::from_str(raw).map_err(|err| Error::Malformed {
        text: err.to_string(),
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          forwarding                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Relay a data-path request to a live owner of the group, excluding hosts already visited.
/// The response is mirrored back verbatim, status and all.
async fn forward(manager: &Manager, path: &str, group: &Group, form: &DataForm) -> Result<Response> {
    let me = manager.registry().hostname().clone();
    let mut visited: HashSet<Hostname> = form
        .hosts_visited
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(Hostname::new)
        .collect();
    visited.insert(me.clone());

    let target = group
        .owners
        .keys()
        .find(|host| !visited.contains(host))
        .cloned()
        .ok_or(Error::Provisioning)?;

    let mut relayed = form.clone();
    relayed.hosts_visited = Some(visited.iter().map(Hostname::as_str).join(","));

    let url = format!(
        "http://{}:{}{}",
        target,
        manager.config().http.port,
        path
    );
    debug!(%url, "forwarding a data-path request");
    let rsp = manager
        .http()
        .post(&url)
        .form(&relayed)
        .send()
        .await
        .map_err(Error::internal)?;
    let status =
        StatusCode::from_u16(rsp.status().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = rsp.text().await.map_err(Error::internal)?;
    Ok((status, body).into_response())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         `/rec`                                                 //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize, Serialize)]
pub struct RecRsp {
    pub success: bool,
    pub reqs_sec: u64,
    pub stored_elements: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recs: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Insert or query recommendations. `insert=true` ingests without predicting; otherwise
/// `max_recs` bounds the returned item list. Either way the scores feed the model.
async fn rec(State(manager): State<Arc<Manager>>, Form(form): Form<DataForm>) -> Response {
    async fn rec1(manager: &Manager, form: &DataForm) -> Result<Response> {
        let group = auth_group(manager, form)?;
        let (rec, stats) = match local_serving_shard(manager, &group) {
            Some(local) => local,
            None => return forward(manager, REC_PATH, &group, form).await,
        };

        let insert = form.insert.is_some();
        let reqs_sec = if insert {
            let inserts = stats.note_insert();
            if inserts > group.meta.max_insert_req_sec {
                return Err(Error::TooManyRequests);
            }
            inserts
        } else {
            let queries = stats.note_query();
            if queries > group.meta.max_req_sec {
                return Err(Error::TooManyRequests);
            }
            queries
        };

        let record_id = parse_u64(form.id.as_ref(), "id")?;
        let scores = parse_score_map(form.scores.as_deref().unwrap_or("{}"))?;

        if insert {
            rec.add_record(record_id, scores);
            return Ok(Json(RecRsp {
                success: true,
                reqs_sec,
                stored_elements: rec.stored_cells(),
                recs: None,
                status: None,
            })
            .into_response());
        }

        let max_recs = parse_u64(form.max_recs.as_ref(), "max_recs")? as usize;
        let recs = rec.calc_scores(record_id, &scores, max_recs);
        let rsp = if recs.is_empty() {
            RecRsp {
                success: false,
                reqs_sec,
                stored_elements: rec.stored_cells(),
                recs: Some(recs),
                status: Some("acquiring data".to_owned()),
            }
        } else {
            RecRsp {
                success: true,
                reqs_sec,
                stored_elements: rec.stored_cells(),
                recs: Some(recs),
                status: None,
            }
        };
        Ok(Json(rsp).into_response())
    }

    match rec1(&manager, &form).await {
        Ok(rsp) => rsp,
        Err(err) => err.into_response(),
    }
}

/// A shard is locally servable once it has a model verdict: active, or legitimately empty.
/// Anything earlier (still starting, still loading) routes remote.
fn local_serving_shard(
    manager: &Manager,
    group: &Group,
) -> Option<(
    Arc<crate::recommender::Recommender>,
    Arc<crate::manager::ShardStats>,
)> {
    manager
        .local_shard(&group.meta.group_id)
        .filter(|(rec, _)| matches!(rec.status(), Status::Active | Status::NoRecords))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        `/scores`                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize, Serialize)]
pub struct ScoresRsp {
    pub success: bool,
    pub stored_elements: u64,
    pub scores: HashMap<String, f64>,
}

/// Average scores for a list of items, from the per-item statistics of the last rebuild.
async fn scores(State(manager): State<Arc<Manager>>, Form(form): Form<DataForm>) -> Response {
    async fn scores1(manager: &Manager, form: &DataForm) -> Result<Response> {
        let group = auth_group(manager, form)?;
        let (rec, stats) = match local_serving_shard(manager, &group) {
            Some(local) => local,
            None => return forward(manager, SCORES_PATH, &group, form).await,
        };

        if stats.note_query() > group.meta.max_req_sec {
            return Err(Error::TooManyRequests);
        }

        let items = parse_item_list(form.items.as_deref().unwrap_or("[]"))?;
        let scores = rec
            .avg_scores(&items)
            .into_iter()
            .map(|(item, avg)| (item.to_string(), avg))
            .collect();
        Json(ScoresRsp {
            success: true,
            stored_elements: rec.stored_cells(),
            scores,
        })
        .into_response()
        .pipe(Ok)
    }

    match scores1(&manager, &form).await {
        Ok(rsp) => rsp,
        Err(err) => err.into_response(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         `/info`                                                //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Per-shard stats, keyed by owner hostname. A direct call (no `fw`) fans out to every other
/// owner in the group's ownership map; the relayed calls carry `fw=1` so they answer with only
/// their local blob.
async fn info(State(manager): State<Arc<Manager>>, Form(form): Form<DataForm>) -> Response {
    async fn info1(manager: &Manager, form: &DataForm) -> Result<Response> {
        let group = auth_group(manager, form)?;
        let me = manager.registry().hostname().clone();

        let mut blobs: HashMap<String, StatsBlob> = HashMap::new();
        if let Some(blob) = manager.stats_blob(&group.meta.group_id) {
            blobs.insert(me.to_string(), blob);
        }

        if form.fw.is_none() {
            for host in group.owners.keys().filter(|h| **h != me) {
                let url = format!(
                    "http://{}:{}{}",
                    host,
                    manager.config().http.port,
                    GROUP_INFO_PATH
                );
                let relay = DataForm {
                    uid: form.uid.clone(),
                    key: form.key.clone(),
                    group: form.group.clone(),
                    fw: Some("1".to_owned()),
                    ..DataForm::default()
                };
                match manager.http().post(&url).form(&relay).send().await {
                    Ok(rsp) => match rsp.json::<HashMap<String, StatsBlob>>().await {
                        Ok(remote) => blobs.extend(remote),
                        Err(err) => {
                            error!(%host, %err, "unparseable group info from a peer")
                        }
                    },
                    Err(err) => error!(%host, %err, "can't retrieve group info from a peer"),
                }
            }
        }

        Json(blobs).into_response().pipe(Ok)
    }

    match info1(&manager, &form).await {
        Ok(rsp) => rsp,
        Err(err) => err.into_response(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    group administration                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize, Serialize)]
pub struct KeyRsp {
    pub success: bool,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OkRsp {
    pub success: bool,
}

/// Group ids are embedded in URLs and echoed back in JSON; scrub the obvious trouble.
fn sanitize_group_tag(raw: &str) -> String {
    raw.chars()
        .filter_map(|c| match c {
            ' ' => Some('-'),
            '<' | '>' | '"' | '\'' => None,
            c => Some(c),
        })
        .collect()
}

/// Create a group (or update an existing one's settings). The tier tag expands to the capacity
/// defaults; the response carries the minted secret.
async fn add_group(State(manager): State<Arc<Manager>>, Form(form): Form<AdminForm>) -> Response {
    async fn add_group1(manager: &Manager, form: &AdminForm) -> Result<KeyRsp> {
        let user = auth_user(manager, &form.u, &form.uk).await?;

        let kind = form.gt.as_deref().unwrap_or_default();
        let tier = manager
            .config()
            .tiers
            .get(kind)
            .ok_or_else(|| Error::Unprocessable {
                text: "Group type required".to_owned(),
            })?;
        let num_shards = parse_u64(form.shards.as_ref(), "shards")? as u32;
        let max_score = parse_u64(form.maxscore.as_ref(), "maxscore")?;
        if !(1..=255).contains(&max_score) {
            return Err(Error::Unprocessable {
                text: "The param maxscore has to be in 1..=255".to_owned(),
            });
        }

        let tag = sanitize_group_tag(form.guid.as_deref().unwrap_or_default());
        let group_id = GroupId::new(format!("{}:{}", tag, uuid::Uuid::new_v4()));
        let (_, key) = manager
            .groups()
            .add_update_group(
                kind,
                user.user_id,
                group_id.clone(),
                num_shards,
                tier.records,
                tier.reqs,
                tier.reqs * 4,
                max_score as u8,
            )
            .await
            .map_err(Error::internal)?;

        Ok(KeyRsp {
            success: true,
            key,
            group_id: Some(group_id.to_string()),
        })
    }

    match add_group1(&manager, &form).await {
        Ok(rsp) => (StatusCode::OK, Json(rsp)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn set_shards_group(
    State(manager): State<Arc<Manager>>,
    Form(form): Form<AdminForm>,
) -> Response {
    async fn set_shards1(manager: &Manager, form: &AdminForm) -> Result<OkRsp> {
        auth_user(manager, &form.u, &form.uk).await?;
        let group = auth_admin_group(manager, form)?;
        let num_shards = parse_u64(form.s.as_ref(), "s")? as u32;
        manager
            .groups()
            .set_num_shards(&group.meta.group_id, num_shards)
            .await
            .map_err(Error::internal)?;
        Ok(OkRsp { success: true })
    }

    match set_shards1(&manager, &form).await {
        Ok(rsp) => (StatusCode::OK, Json(rsp)).into_response(),
        Err(err) => err.into_response(),
    }
}

/// The `(u, uk)`-authenticated admin endpoints still need the group secret to touch a group.
fn auth_admin_group(manager: &Manager, form: &AdminForm) -> Result<Group> {
    manager
        .groups()
        .authenticate(
            &form.u,
            form.k.as_deref().unwrap_or_default(),
            form.g.as_deref().unwrap_or_default(),
        )
        .map_err(|_| UnauthorizedSnafu.build())
}

async fn generate_group_key(
    State(manager): State<Arc<Manager>>,
    Form(form): Form<AdminForm>,
) -> Response {
    async fn generate1(manager: &Manager, form: &AdminForm) -> Result<KeyRsp> {
        auth_user(manager, &form.u, &form.uk).await?;
        let group = auth_admin_group(manager, form)?;
        let key = manager
            .groups()
            .regenerate_key(&group.meta.group_id)
            .await
            .map_err(Error::internal)?;
        Ok(KeyRsp {
            success: true,
            key,
            group_id: None,
        })
    }

    match generate1(&manager, &form).await {
        Ok(rsp) => (StatusCode::OK, Json(rsp)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_groups_by_user(
    State(manager): State<Arc<Manager>>,
    Form(form): Form<AdminForm>,
) -> Response {
    async fn get_groups1(
        manager: &Manager,
        form: &AdminForm,
    ) -> Result<HashMap<String, crate::entities::GroupMeta>> {
        let user = auth_user(manager, &form.u, &form.uk).await?;
        Ok(manager
            .groups()
            .groups_for_user(&user.user_id)
            .into_iter()
            .map(|g| (g.meta.group_id.to_string(), g.meta))
            .collect())
    }

    match get_groups1(&manager, &form).await {
        Ok(rsp) => (StatusCode::OK, Json(rsp)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn del_group(State(manager): State<Arc<Manager>>, Form(form): Form<AdminForm>) -> Response {
    async fn del_group1(manager: &Manager, form: &AdminForm) -> Result<OkRsp> {
        auth_user(manager, &form.u, &form.uk).await?;
        let group = auth_admin_group(manager, form)?;
        manager
            .groups()
            .remove_group(&group.meta.group_id)
            .await
            .map_err(Error::internal)?;
        Ok(OkRsp { success: true })
    }

    match del_group1(&manager, &form).await {
        Ok(rsp) => (StatusCode::OK, Json(rsp)).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Wipe the group's content everywhere, persisted snapshots included. Slow by design: the group
/// passes through `num_shards = 0` for a full lease TTL so every owner drops out.
async fn remove_content(
    State(manager): State<Arc<Manager>>,
    Form(form): Form<AdminForm>,
) -> Response {
    async fn remove_content1(manager: &Manager, form: &AdminForm) -> Result<OkRsp> {
        auth_user(manager, &form.u, &form.uk).await?;
        let group = auth_admin_group(manager, form)?;
        manager
            .remove_content(&group)
            .await
            .map_err(Error::internal)?;
        Ok(OkRsp { success: true })
    }

    match remove_content1(&manager, &form).await {
        Ok(rsp) => (StatusCode::OK, Json(rsp)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn score_maps_distinguish_malformed_from_invalid() {
        assert!(matches!(
            parse_score_map("not json"),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            parse_score_map(r#"{"abc": 3}"#),
            Err(Error::Unprocessable { .. })
        ));
        let ok = parse_score_map(r#"{"17": 4, "3": 0}"#).unwrap();
        assert_eq!(ok[&17], 4);
        assert_eq!(ok[&3], 0);
    }

    #[test]
    fn group_tags_are_scrubbed() {
        assert_eq!(
            sanitize_group_tag("my movies <script>\"'"),
            "my-movies-script"
        );
    }

    #[test]
    fn integer_params_fail_as_unprocessable() {
        let missing: Option<&String> = None;
        assert!(matches!(
            parse_u64(missing, "id"),
            Err(Error::NotAnInteger { .. })
        ));
        let bad = "seven".to_owned();
        assert!(matches!(
            parse_u64(Some(&bad), "id"),
            Err(Error::NotAnInteger { .. })
        ));
        let good = "7".to_owned();
        assert_eq!(parse_u64(Some(&good), "id").unwrap(), 7);
    }

    #[test]
    fn error_statuses_follow_the_contract() {
        let cases: Vec<(Error, StatusCode)> = vec![
            (UnauthorizedSnafu.build(), StatusCode::UNAUTHORIZED),
            (
                Error::Malformed {
                    text: "x".to_owned(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::NotAnInteger {
                    param: "id".to_owned(),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (Error::TooManyRequests, StatusCode::TOO_MANY_REQUESTS),
            (Error::Provisioning, StatusCode::SERVICE_UNAVAILABLE),
            (
                Error::Internal {
                    text: "boom".to_owned(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.as_status_and_msg().0, status);
        }
    }
}
