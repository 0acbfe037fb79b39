//! One-shot store inspection.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::models::timeframe::timeframe_literal;
use crate::services::Persistence;

pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let persistence = Persistence::try_connect(config.clone()).await?;
    persistence.ensure_retention_policies().await?;

    println!("store: {}", config.database_path.display());
    println!("role: {:?}", config.role);
    println!("markets: {}", config.pairs.join(", "));
    println!();
    println!("{:<12} {:>12}", "timeframe", "bars");
    for timeframe in config.timeframes() {
        let count = persistence.measurement_row_count(timeframe).await?;
        println!("{:<12} {:>12}", timeframe_literal(timeframe), count);
    }

    Ok(())
}
