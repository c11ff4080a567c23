//! Crawler worker: bound to one spider for a run, it drives the
//! download -> parse -> collect -> record-history loop with a randomized
//! pause between dispatches. Parse callbacks run on blocking threads and
//! their panics are isolated per request.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::context::Context;
use crate::counters::{PageStats, Report};
use crate::downloader::DownloaderSet;
use crate::matrix::Slot;
use crate::output::SinkFactory;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::request::Request;
use crate::scheduler::Scheduler;
use crate::spider::Spider;

const EMPTY_PULL_NAP: Duration = Duration::from_millis(20);

/// Everything a crawler needs besides its spider; cloned per worker.
#[derive(Clone)]
pub struct CrawlerSeed {
    pub scheduler: Arc<Scheduler>,
    pub downloaders: Arc<DownloaderSet>,
    pub sink_factory: SinkFactory,
    pub stats: Arc<PageStats>,
    pub report_tx: flume::Sender<Report>,
    pub pipeline_settings: PipelineSettings,
    /// Global pause reference applied to spiders that declared none.
    pub default_pause_ms: u64,
}

struct Bound {
    spider: Arc<Spider>,
    pipeline: Arc<Pipeline>,
    /// [base, jitter span]: sleep = base + uniform(0..span).
    pause: (u64, u64),
}

pub struct Crawler {
    id: usize,
    seed: CrawlerSeed,
    bound: Option<Bound>,
}

impl Crawler {
    pub fn new(id: usize, seed: CrawlerSeed) -> Self {
        Self {
            id,
            seed,
            bound: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Binds a spider: request matrix, output pipeline, pause window.
    pub fn init(&mut self, spider: Arc<Spider>) {
        spider.set_pause_reference(self.seed.default_pause_ms, false);
        spider.matrix_init(&self.seed.scheduler);

        let sink = (self.seed.sink_factory)(&spider);
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&spider),
            self.seed.pipeline_settings.clone(),
            sink,
            self.seed.report_tx.clone(),
        ));

        let base = spider.pause_reference() / 2;
        let span = if base > 0 { base * 3 } else { 1 };
        self.bound = Some(Bound {
            spider,
            pipeline,
            pause: (base, span),
        });
    }

    /// Runs the bound spider to completion: root rule, then the pull
    /// loop until the matrix drains, then cleanup and the pipeline stop
    /// that triggers the run report.
    pub async fn run(&mut self) {
        let Some(bound) = self.bound.take() else {
            return;
        };
        let spider = bound.spider;
        let pipeline = bound.pipeline;
        pipeline.start();

        debug!(crawler = self.id, spider = %spider.name, "spider starting");
        self.exec_root(&spider, &pipeline).await;
        spider.mark_running();

        loop {
            let Some(req) = spider.matrix().pull().await else {
                if spider.can_stop().await {
                    break;
                }
                sleep(EMPTY_PULL_NAP).await;
                continue;
            };

            let Some(slot) = spider.matrix().occupy().await else {
                break;
            };
            let spider_task = Arc::clone(&spider);
            let pipeline_task = Arc::clone(&pipeline);
            let downloaders = Arc::clone(&self.seed.downloaders);
            let stats = Arc::clone(&self.seed.stats);
            tokio::spawn(async move {
                process(req, slot, spider_task, pipeline_task, downloaders, stats).await;
            });

            self.throttle(bound.pause).await;
        }

        spider.finish().await;
        pipeline.stop();
        debug!(crawler = self.id, spider = %spider.name, "spider finished");
    }

    /// Executes the root entrypoint on a blocking thread and admits the
    /// requests it queued.
    async fn exec_root(&self, spider: &Arc<Spider>, pipeline: &Arc<Pipeline>) {
        let ctx = Context::new(Arc::clone(spider), Request::default(), None);
        let joined = tokio::task::spawn_blocking(move || {
            let mut ctx = ctx;
            let root = ctx.spider().tree.root.clone();
            root(&mut ctx);
            ctx
        })
        .await;

        match joined {
            Ok(mut ctx) => {
                drain_outputs(&mut ctx, pipeline).await;
                for req in ctx.take_queued() {
                    spider.matrix().push(req).await;
                }
            }
            Err(err) if err.is_panic() => {
                error!(spider = %spider.name, "panic in root rule");
            }
            Err(_) => {}
        }
    }

    async fn throttle(&self, pause: (u64, u64)) {
        let jitter = rand::thread_rng().gen_range(0..pause.1.max(1));
        sleep(Duration::from_millis(pause.0 + jitter)).await;
    }
}

/// One request, end to end. The slot is released on return, strictly
/// after the history record for this request is written.
async fn process(
    req: Request,
    slot: Slot,
    spider: Arc<Spider>,
    pipeline: Arc<Pipeline>,
    downloaders: Arc<DownloaderSet>,
    stats: Arc<PageStats>,
) {
    let _slot = slot;
    debug!(url = %req.url, "fetching");

    let response = match downloaders.select(req.downloader).download(&req).await {
        Ok(resp) => resp,
        Err(err) => {
            spider.matrix().do_history(&req, false);
            stats.record_failure();
            error!(url = %req.url, %err, "download failed");
            return;
        }
    };

    let rule_name = req.rule.clone();
    let ctx = Context::new(Arc::clone(&spider), req.clone(), Some(response));
    let joined = tokio::task::spawn_blocking(move || {
        let mut ctx = ctx;
        ctx.run_rule(&rule_name);
        ctx
    })
    .await;

    let mut ctx = match joined {
        Ok(ctx) => ctx,
        Err(err) => {
            if spider.is_stopping() {
                return;
            }
            spider.matrix().do_history(&req, false);
            stats.record_failure();
            if err.is_panic() {
                error!(url = %req.url, "panic in parse rule");
            } else {
                error!(url = %req.url, %err, "parse task failed");
            }
            return;
        }
    };

    drain_outputs(&mut ctx, &pipeline).await;
    for queued in ctx.take_queued() {
        spider.matrix().push(queued).await;
    }

    spider.matrix().do_history(&req, true);
    stats.record_success();
    info!(url = %req.url, "done");
}

/// Hands files then items to the pipeline. A closed pipeline stops the
/// drain so the worker does not spin on a dead sink.
async fn drain_outputs(ctx: &mut Context, pipeline: &Pipeline) {
    for file in ctx.take_files() {
        if pipeline.collect_file(file).await.is_err() {
            break;
        }
    }
    for item in ctx.take_items() {
        if pipeline.collect_data(item).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_window_spans_half_to_double() {
        // base = p/2, span = 3 * base, so sleep in [p/2, 2p)
        let p: u64 = 300;
        let base = p / 2;
        let span = base * 3;
        assert_eq!(base, 150);
        assert_eq!(base + span, 2 * p);
    }
}
