/*
[INPUT]:  Paradex WebSocket URL and a market symbol
[OUTPUT]: Top-of-book and trade lines printed until Ctrl-C
[POS]:    Examples - receiver façade with closure callbacks
[UPDATE]: When the receiver or sink API changes
*/

use std::sync::Arc;

use paradex_feed_adapter::*;
use tokio_util::sync::CancellationToken;

/// Example: stream BTC-USD-PERP book snapshots and trades
///
/// Public channels need no bearer token. Stop with Ctrl-C.
#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Paradex Feed Example ===\n");

    let config = ReceiverConfig {
        book_symbols: vec!["BTC-USD-PERP".to_string()],
        trade_symbols: vec!["BTC-USD-PERP".to_string()],
        depth: 5,
        ..ReceiverConfig::default()
    };

    let sink = Arc::new(CallbackSink::new(
        |snapshot: Snapshot| {
            let bid = snapshot.best_bid().map(|level| level.price.to_string());
            let ask = snapshot.best_ask().map(|level| level.price.to_string());
            println!(
                "book  {} seq={} bid={} ask={}",
                snapshot.symbol,
                snapshot.seq,
                bid.as_deref().unwrap_or("-"),
                ask.as_deref().unwrap_or("-")
            );
        },
        |trade: TradeEvent| {
            println!(
                "trade {} {} {} @ {}",
                trade.symbol, trade.side, trade.amount, trade.price
            );
        },
    ));

    let receiver = FeedReceiver::new(config, sink)?;
    let stop = CancellationToken::new();
    let stop_on_ctrl_c = stop.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        stop_on_ctrl_c.cancel();
    });

    receiver.run(stop).await?;
    println!("\n✓ Feed stopped: {:?}", receiver.stats());
    Ok(())
}
