use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use shardload::sink::{DiscardSink, PrintSink, StorageSink};
use shardload::{ImportError, ImportSummary, ShardingProcessor};

use crate::config::Config;

/// Lower-cased, de-duplicated domains of a list file. Blank lines and `#` comments are skipped.
pub fn parse_domains(contents: &str) -> Vec<String> {
    let mut seen = HashSet::new();

    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_lowercase)
        .filter(|domain| seen.insert(domain.clone()))
        .collect()
}

/// Import the configured domain list, cancelling the run when `shutdown` resolves.
///
/// A cancelled run is not an error: its partial summary is returned.
pub async fn run<F>(config: Config, shutdown: F) -> anyhow::Result<ImportSummary>
where
    F: Future<Output = ()>,
{
    let contents = tokio::fs::read_to_string(&config.domains_path)
        .await
        .with_context(|| format!("failed to read domain list {}", config.domains_path))?;
    let domains = parse_domains(&contents);
    info!(path = config.domains_path, domains = domains.len(), "loaded domain list");

    let sink: Arc<dyn StorageSink> = if config.print_sink {
        Arc::new(PrintSink {})
    } else {
        Arc::new(DiscardSink {})
    };

    let cancel = CancellationToken::new();
    let processor = ShardingProcessor::new(config.import_config(), sink)?
        .with_cancellation(cancel.clone());

    let import = processor.process_keys(domains);
    tokio::pin!(import);
    tokio::pin!(shutdown);

    let result = tokio::select! {
        result = &mut import => result,
        _ = &mut shutdown => {
            info!("shutdown requested, cancelling import");
            cancel.cancel();
            import.await
        }
    };

    match result {
        Ok(summary) => Ok(summary),
        Err(ImportError::Cancelled(summary)) => {
            warn!(
                inserted = summary.metrics.records_inserted,
                cancelled = summary.metrics.records_cancelled,
                "import cancelled"
            );
            Ok(*summary)
        }
        Err(err) => Err(err.into()),
    }
}
