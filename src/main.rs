use std::collections::HashMap;
use std::sync::Arc;

use arachne::cli::Cli;
use arachne::{Context, Engine, Mode, Request, Rule, Spider};
use serde_json::json;

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();
    let selection = cli.spider.clone();
    let conf = match cli.into_conf() {
        Ok(conf) => conf,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    // worker mode forwards its log lines to the master
    let forward = if conf.mode == Mode::Worker {
        let (tx, rx) = flume::bounded(1024);
        Some((tx, rx))
    } else {
        None
    };
    let forward_tx = forward.as_ref().map(|(tx, _)| tx.clone());
    if let Err(err) = arachne::logging::init_logging(&conf.log_dir, forward_tx) {
        eprintln!("logging init failed: {err}");
        std::process::exit(2);
    }

    let mut engine = Engine::new(conf);
    if let Some((_, rx)) = forward {
        engine.set_log_lines(rx);
    }
    for spider in library() {
        engine.register(spider);
    }

    if let Err(err) = engine.init().await {
        eprintln!("init failed: {err}");
        std::process::exit(1);
    }

    if engine.conf().mode != Mode::Worker {
        let chosen = engine.select(&selection);
        if chosen.is_empty() {
            eprintln!("no spiders selected; library has {}", engine.library().len());
            std::process::exit(2);
        }
        engine.spider_prepare(&chosen);
    }

    let handle = engine.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, stopping");
            handle.stop().await;
        }
    });
    engine.run().await;
}

/// Built-in spider library. Real deployments register their own spiders
/// through the `Engine` API; this one exercises the whole stack against
/// a single seed page.
fn library() -> Vec<Spider> {
    let root: arachne::ParseFn = Arc::new(|ctx: &mut Context| {
        let mut req = Request::new("http://example.com/", "page");
        req.priority = 1;
        ctx.add_queue(req);
    });

    let parse_page: arachne::ParseFn = Arc::new(|ctx: &mut Context| {
        let dom = ctx.dom();
        let title = scraper::Selector::parse("title")
            .ok()
            .and_then(|sel| {
                dom.select(&sel)
                    .next()
                    .map(|el| el.text().collect::<String>())
            })
            .unwrap_or_default();
        ctx.output(
            HashMap::from([
                ("title".to_string(), json!(title.trim())),
                ("bytes".to_string(), json!(ctx.text().len())),
            ]),
            None,
        );
        ctx.file_output(None);
    });

    vec![Spider::new("page_probe", root)
        .description("fetches one page, records its title and archives the body")
        .rule("page", Rule::new(&["title", "bytes"], parse_page))]
}
