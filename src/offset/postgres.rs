use anyhow::Context;
use async_trait::async_trait;
use log::debug;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Connection, Row};

use super::{CaptureCursor, OffsetReader};
use crate::descriptor::{ConnectionDescriptor, extra};

/// Confirmed flush LSN of the capture slot, else the server's current WAL LSN.
pub struct PostgresOffsetReader;

#[async_trait]
impl OffsetReader for PostgresOffsetReader {
    async fn read(
        &self,
        descriptor: &ConnectionDescriptor,
        cursor: Option<&CaptureCursor>,
    ) -> anyhow::Result<String> {
        let opts = connect_options(descriptor);
        let mut conn = PgConnection::connect_with(&opts)
            .await
            .with_context(|| format!("connect postgres {}", descriptor.host))?;
        let position = query_position(&mut conn, cursor).await;
        if let Err(err) = conn.close().await {
            debug!("[offset] close postgres connection: {}", err);
        }
        position
    }
}

async fn query_position(
    conn: &mut PgConnection,
    cursor: Option<&CaptureCursor>,
) -> anyhow::Result<String> {
    if let Some(CaptureCursor::ReplicationSlot(slot)) = cursor {
        let row = sqlx::query(
            "SELECT confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1",
        )
        .bind(slot)
        .fetch_optional(&mut *conn)
        .await
        .context("query pg_replication_slots")?;
        let confirmed = row.and_then(|r| r.try_get::<Option<String>, _>(0).ok().flatten());
        if let Some(lsn) = confirmed {
            return Ok(lsn);
        }
        debug!("[offset] slot {} has no confirmed position yet, using current WAL", slot);
    }
    let lsn: String = sqlx::query_scalar("SELECT pg_current_wal_lsn()::text")
        .fetch_one(&mut *conn)
        .await
        .context("query pg_current_wal_lsn")?;
    Ok(lsn)
}

fn connect_options(d: &ConnectionDescriptor) -> PgConnectOptions {
    let mut opts = PgConnectOptions::new()
        .host(d.host.trim())
        .port(d.effective_port().unwrap_or(5432))
        .username(&d.username)
        .application_name("cdc-connectors-offset")
        .ssl_mode(if d.extra_flag(extra::SSL) {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        });
    if !d.password.is_empty() {
        opts = opts.password(&d.password);
    }
    if !d.database.trim().is_empty() {
        opts = opts.database(d.database.trim());
    }
    opts
}
