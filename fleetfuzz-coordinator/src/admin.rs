// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Minimal operator page: one table of live nodes rendered straight from
//! the registry. Deliberately dependency-free; anything fancier belongs in
//! an external dashboard fed by the metrics poller.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Html;

use crate::server::ServerContext;

pub async fn overview(State(ctx): State<Arc<ServerContext>>) -> Html<String> {
    let all_stats = ctx.registry.get_all_stats().await;

    let mut nodes: Vec<_> = all_stats.into_iter().collect();
    nodes.sort_by(|a, b| a.0.cmp(&b.0));

    let mut rows = String::new();
    for (fuzzer_id, stats) in &nodes {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{:.2}</td><td>{}</td><td>{}</td><td>{}</td>\
             <td>{}</td><td>{}</td></tr>\n",
            fuzzer_id,
            stats.execs_per_sec,
            stats.paths_total,
            stats.paths_found,
            stats.unique_crashes,
            stats.unique_hangs,
            stats.last_update,
        ));
    }

    Html(format!(
        "<!doctype html>\n<html><head><title>fleetfuzz</title></head><body>\n\
         <h1>fleet overview</h1>\n\
         <p>{} live fuzzers</p>\n\
         <table border=\"1\">\n\
         <tr><th>fuzzer</th><th>execs/s</th><th>paths</th><th>found</th>\
         <th>crashes</th><th>hangs</th><th>last update</th></tr>\n\
         {}\
         </table>\n</body></html>\n",
        nodes.len(),
        rows,
    ))
}
