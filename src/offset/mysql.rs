use anyhow::Context;
use async_trait::async_trait;
use log::debug;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow, MySqlSslMode};
use sqlx::{Connection, Row};

use super::{CaptureCursor, OffsetReader};
use crate::descriptor::{ConnectionDescriptor, extra};

/// Current binlog coordinates as `<file>:<pos>`.
pub struct MysqlOffsetReader;

#[async_trait]
impl OffsetReader for MysqlOffsetReader {
    async fn read(
        &self,
        descriptor: &ConnectionDescriptor,
        _cursor: Option<&CaptureCursor>,
    ) -> anyhow::Result<String> {
        let opts = connect_options(descriptor);
        let mut conn = MySqlConnection::connect_with(&opts)
            .await
            .with_context(|| format!("connect mysql {}", descriptor.host))?;
        let position = binlog_position(&mut conn).await;
        if let Err(err) = conn.close().await {
            debug!("[offset] close mysql connection: {}", err);
        }
        position
    }
}

async fn binlog_position(conn: &mut MySqlConnection) -> anyhow::Result<String> {
    // 8.2+ 使用 SHOW BINARY LOG STATUS，旧版本回退到 SHOW MASTER STATUS
    let row = match sqlx::query("SHOW BINARY LOG STATUS")
        .fetch_optional(&mut *conn)
        .await
    {
        Ok(row) => row,
        Err(err) => {
            debug!("[offset] SHOW BINARY LOG STATUS failed ({}), trying SHOW MASTER STATUS", err);
            sqlx::query("SHOW MASTER STATUS")
                .fetch_optional(&mut *conn)
                .await
                .context("query binlog status")?
        }
    };
    let coordinates = match row {
        Some(row) => Some(read_coordinates(&row)?),
        None => None,
    };
    format_position(coordinates)
}

fn read_coordinates(row: &MySqlRow) -> anyhow::Result<(String, u64)> {
    let file: String = row.try_get(0).context("binlog file column")?;
    let pos: u64 = row.try_get(1).context("binlog position column")?;
    Ok((file, pos))
}

/// `None` means the status query returned no rows.
fn format_position(coordinates: Option<(String, u64)>) -> anyhow::Result<String> {
    let Some((file, pos)) = coordinates else {
        anyhow::bail!("binlog status returned no rows; binary logging may be disabled");
    };
    if file.trim().is_empty() {
        anyhow::bail!("binlog status returned an empty file name");
    }
    Ok(format!("{file}:{pos}"))
}

fn connect_options(d: &ConnectionDescriptor) -> MySqlConnectOptions {
    let mut opts = MySqlConnectOptions::new()
        .host(d.host.trim())
        .port(d.effective_port().unwrap_or(3306))
        .username(&d.username)
        .ssl_mode(if d.extra_flag(extra::SSL) {
            MySqlSslMode::Required
        } else {
            MySqlSslMode::Preferred
        });
    if !d.password.is_empty() {
        opts = opts.password(&d.password);
    }
    opts
}
