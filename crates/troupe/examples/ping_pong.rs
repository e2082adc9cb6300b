//! Two players bounce a ball until one of them has hit it ten times.
//!
//! Run with `cargo run -p troupe --example ping_pong`.

use std::sync::mpsc;
use std::time::Duration;
use tracing::info;
use troupe::{
    setup_global_logging, Context, ObjectId, Routable, RouteTable, RoutedHandler, Runtime,
    SystemConfig,
};

const RALLY_LENGTH: u32 = 10;

#[derive(Debug)]
enum Rally {
    Serve { to: ObjectId },
    Ball { from: ObjectId, count: u32 },
    Timeout,
}

#[derive(Debug, PartialEq, Eq, Hash)]
enum RallyKind {
    Serve,
    Ball,
    Timeout,
}

impl Routable for Rally {
    type Kind = RallyKind;

    fn kind(&self) -> RallyKind {
        match self {
            Rally::Serve { .. } => RallyKind::Serve,
            Rally::Ball { .. } => RallyKind::Ball,
            Rally::Timeout => RallyKind::Timeout,
        }
    }
}

struct Player {
    name: &'static str,
    hits: u32,
    finished: mpsc::Sender<String>,
}

fn hit(player: &mut Player, ctx: &Context<Rally>, to: ObjectId, count: u32) {
    player.hits += 1;
    info!("{} hits the ball ({})", player.name, count);
    let ball = Rally::Ball {
        from: ctx.id,
        count,
    };
    if !matches!(ctx.system.post_message(to, ball), Ok(true)) {
        let _ = player.finished.send(format!("{} lost the other player", player.name));
    }
}

fn rules() -> RouteTable<Player, Rally> {
    RouteTable::builder()
        .route(RallyKind::Serve, |player: &mut Player, ctx, message| {
            if let Rally::Serve { to } = message {
                hit(player, ctx, to, 1);
            }
        })
        .route(RallyKind::Ball, |player: &mut Player, ctx, message| {
            let Rally::Ball { from, count } = message else {
                return;
            };
            if count >= RALLY_LENGTH {
                let _ = player
                    .finished
                    .send(format!("{} wins after {} hits", player.name, count));
            } else {
                hit(player, ctx, from, count + 1);
            }
        })
        .route(RallyKind::Timeout, |player: &mut Player, _, _| {
            let _ = player.finished.send(format!("{} timed out", player.name));
        })
        .on_dispose(|player: &mut Player| {
            info!("{} leaves the table after {} hits", player.name, player.hits);
        })
        .build()
}

fn main() -> anyhow::Result<()> {
    let config = SystemConfig::default().with_workers(2);
    let log_path = std::env::temp_dir().join("troupe-ping-pong.log");
    setup_global_logging(&log_path, &config.level()?, true)?;

    let runtime = Runtime::start(config)?;
    let system = runtime.system();
    let (finished_tx, finished_rx) = mpsc::channel();

    let table = rules();
    let ping = system.add_object(RoutedHandler::new(
        Player {
            name: "ping",
            hits: 0,
            finished: finished_tx.clone(),
        },
        table.clone(),
    ))?;
    let pong = system.add_object(RoutedHandler::new(
        Player {
            name: "pong",
            hits: 0,
            finished: finished_tx,
        },
        table,
    ))?;

    // The serve is delayed; the timeout is cancelled when pong leaves.
    system.post_message_later(20, ping, Rally::Serve { to: pong }, || {
        info!("serve was cancelled");
    })?;
    system.post_message_later(60_000, pong, Rally::Timeout, || {
        info!("pong's timeout was cancelled");
    })?;

    let result = finished_rx.recv_timeout(Duration::from_secs(5))?;
    println!("{}", result);

    system.remove_object(pong)?;
    println!("{}", system.stats()?);
    runtime.shutdown()?;
    Ok(())
}
