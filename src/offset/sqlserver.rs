use anyhow::Context;
use async_trait::async_trait;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncWriteCompatExt;

use super::{CaptureCursor, OffsetReader};
use crate::descriptor::{ConnectionDescriptor, extra};

/// Highest CDC LSN of the database, in `xxxxxxxx:xxxxxxxx:xxxx` form.
pub struct SqlServerOffsetReader;

#[async_trait]
impl OffsetReader for SqlServerOffsetReader {
    async fn read(
        &self,
        descriptor: &ConnectionDescriptor,
        _cursor: Option<&CaptureCursor>,
    ) -> anyhow::Result<String> {
        let config = client_config(descriptor);
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .with_context(|| format!("connect sqlserver {}", descriptor.host))?;
        tcp.set_nodelay(true)?;
        let mut client = Client::connect(config, tcp.compat_write())
            .await
            .context("sqlserver login")?;

        let row = client
            .simple_query("SELECT sys.fn_cdc_get_max_lsn()")
            .await
            .context("query sys.fn_cdc_get_max_lsn")?
            .into_row()
            .await?
            .context("sys.fn_cdc_get_max_lsn returned no rows")?;
        let lsn: &[u8] = row
            .get(0)
            .context("sys.fn_cdc_get_max_lsn returned NULL; CDC may be disabled")?;
        let position = format_lsn(lsn)?;
        client.close().await.ok();
        Ok(position)
    }
}

fn client_config(d: &ConnectionDescriptor) -> Config {
    let mut config = Config::new();
    config.host(d.host.trim());
    config.port(d.effective_port().unwrap_or(1433));
    if !d.database.trim().is_empty() {
        config.database(d.database.trim());
    }
    config.application_name("cdc-connectors-offset");
    config.authentication(AuthMethod::sql_server(&d.username, &d.password));
    if d.extra_flag(extra::SSL) {
        config.encryption(EncryptionLevel::Required);
    } else {
        config.encryption(EncryptionLevel::NotSupported);
    }
    if d.extra_flag(extra::TRUST_CERT) {
        config.trust_cert();
    }
    config
}

fn format_lsn(bytes: &[u8]) -> anyhow::Result<String> {
    if bytes.len() != 10 {
        anyhow::bail!("expected a 10 byte LSN, got {} bytes", bytes.len());
    }
    let hex = |part: &[u8]| part.iter().map(|b| format!("{b:02x}")).collect::<String>();
    Ok(format!(
        "{}:{}:{}",
        hex(&bytes[0..4]),
        hex(&bytes[4..8]),
        hex(&bytes[8..10])
    ))
}
