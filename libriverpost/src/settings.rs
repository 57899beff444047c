//! Copy link settings between bindings

use tracing::info;

use crate::buffer::Buffer;
use crate::error::Result;
use crate::filter::FilterStore;
use crate::types::Link;

/// Copy filter and schedule from `from` onto `to`
///
/// Filter fields set on `from` override the ones on `to`; fields only `to`
/// has are kept. The schedule is copied as is when `from` has one.
pub async fn sync_settings(filters: &FilterStore, buffer: &Buffer, from: &Link, to: &Link) -> Result<()> {
    let source = filters.get(from).await?;
    let target = filters.get(to).await?;
    filters.set(to, &target.merge(&source)).await?;

    if let Some(schedule) = buffer.schedule(&from.gid, &from.provider, &from.user).await? {
        buffer
            .set_schedule(&to.gid, &to.provider, &to.user, Some(&schedule))
            .await?;
    }
    info!(from = %from, to = %to, "Synced settings");
    Ok(())
}
