use anyhow::{bail, Context, Result};
use chrono::Utc;

use crate::store::Store;

/// Refreshes the list of exams an editor instance offers.
pub async fn update_cache(store: &dyn Store, http: &reqwest::Client, editor_link_id: i64) -> Result<()> {
    let link = store
        .editor_link(editor_link_id)
        .await?
        .with_context(|| format!("editor link {editor_link_id} not found"))?;
    let url = format!("{}/api/available-exams", link.url.trim_end_matches('/'));

    let res = http
        .get(&url)
        .send()
        .await
        .with_context(|| format!("fetching {url}"))?;
    if !res.status().is_success() {
        bail!("{url} answered HTTP {}", res.status());
    }
    let exams: serde_json::Value = res.json().await.with_context(|| format!("decoding {url}"))?;
    if !exams.is_array() {
        bail!("{url} did not return a list of exams");
    }

    let count = exams.as_array().map_or(0, Vec::len);
    store.save_editor_link_cache(link.id, exams, Utc::now()).await?;
    tracing::info!(editor_link = link.id, count, "updated editor link cache");
    Ok(())
}
