//! In-silico PCR.
//!
//! A [`Pcrer`] owns a background job that scans the template one primer at a
//! time and yields to the worker's request loop between primers, so status
//! polls and `cancel` are answered while the scan is running.

use super::seq::{find_all, revcomp_bytes};
use super::{Args, CallError, CallResult, Output, Sequence, WorkerObject};
use crate::model::{PcrMatch, PcrProduct, PcrSettings, PcrStatus, Primer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Site {
    primer: usize,
    start: usize,
    len: usize,
    fwd: bool,
}

#[derive(Debug, Default)]
struct JobState {
    processed: usize,
    sites: Vec<Site>,
    done: bool,
    cancelled: bool,
    result: Option<Arc<PcrResults>>,
}

#[derive(Debug)]
struct PcrJob {
    template: Arc<Sequence>,
    primers: Vec<Primer>,
    settings: PcrSettings,
    cancel: AtomicBool,
    state: Mutex<JobState>,
}

impl PcrJob {
    /// Binding sites of one primer on both strands.
    fn scan_primer(&self, idx: usize) -> Vec<Site> {
        let primer = self.primers[idx].seq.as_bytes();
        let template = &self.template.seq;
        let plen = primer.len();
        let fp = self.settings.min_fp.min(plen);

        // forward: the 3' footprint matches the top strand
        let tail = &primer[plen - fp..];
        let mut sites: Vec<Site> = find_all(template, tail)
            .into_iter()
            .map(|pos| {
                let end = pos + fp;
                Site {
                    primer: idx,
                    start: end.saturating_sub(plen),
                    len: plen.min(end),
                    fwd: true,
                }
            })
            .collect();

        // reverse: the footprint's reverse complement matches the top strand
        let rc_tail = revcomp_bytes(tail);
        sites.extend(find_all(template, &rc_tail).into_iter().map(|pos| Site {
            primer: idx,
            start: pos,
            len: plen.min(template.len() - pos),
            fwd: false,
        }));
        sites
    }

    /// Record one scanned primer. Returns `false` once cancelled.
    fn step(&self, idx: usize) -> bool {
        if self.cancel.load(Ordering::Relaxed) {
            let mut state = self.state.lock().expect("pcr state mutex poisoned");
            state.cancelled = true;
            debug!(processed = state.processed, "PCR cancelled");
            return false;
        }
        let sites = self.scan_primer(idx);
        let mut state = self.state.lock().expect("pcr state mutex poisoned");
        state.sites.extend(sites);
        state.processed += 1;
        true
    }

    fn finish(&self) {
        let mut state = self.state.lock().expect("pcr state mutex poisoned");
        let results = PcrResults::collect(
            Arc::clone(&self.template),
            self.primers.clone(),
            &state.sites,
            &self.settings,
        );
        debug!(products = results.products.len(), "PCR finished");
        state.result = Some(Arc::new(results));
        state.done = true;
    }

    async fn run(self: Arc<Self>) {
        for idx in 0..self.primers.len() {
            if !self.step(idx) {
                return;
            }
            tokio::task::yield_now().await;
        }
        self.finish();
    }

    fn run_to_completion(&self) {
        for idx in 0..self.primers.len() {
            if !self.step(idx) {
                return;
            }
        }
        self.finish();
    }
}

/// Handle to a running or finished PCR job.
#[derive(Debug, Clone)]
pub struct Pcrer {
    job: Arc<PcrJob>,
}

impl Pcrer {
    /// Validate the arguments and start the scan.
    pub(super) fn start(args: &mut Args) -> CallResult<Self> {
        let template = args.seq(0)?;
        let primers: Vec<Primer> = args.value(1)?;
        let settings: PcrSettings = args.opt_value(2)?.unwrap_or_default();
        Self::spawn(template, primers, settings)
    }

    pub fn spawn(
        template: Arc<Sequence>,
        primers: Vec<Primer>,
        settings: PcrSettings,
    ) -> CallResult<Self> {
        if primers.is_empty() {
            return Err(CallError::new("At least one primer is required"));
        }
        if let Some(bad) = primers
            .iter()
            .find(|p| p.seq.is_empty() || !p.seq.bytes().all(|b| b.is_ascii_alphabetic()))
        {
            return Err(CallError::new(format!(
                "Primer '{}' has an invalid sequence",
                bad.name
            )));
        }
        if settings.min_fp == 0 {
            return Err(CallError::new("minFp must be at least 1"));
        }
        if settings.min_len > settings.max_len {
            return Err(CallError::new("minLen must not exceed maxLen"));
        }

        let job = Arc::new(PcrJob {
            template,
            primers,
            settings,
            cancel: AtomicBool::new(false),
            state: Mutex::new(JobState::default()),
        });
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(Arc::clone(&job).run());
            }
            Err(_) => job.run_to_completion(),
        }
        Ok(Self { job })
    }

    pub fn status(&self) -> PcrStatus {
        let state = self.job.state.lock().expect("pcr state mutex poisoned");
        PcrStatus {
            done: state.done,
            cancelled: state.cancelled,
            percent: state.processed as f64 * 100.0 / self.job.primers.len() as f64,
        }
    }

    pub fn cancel(&self) {
        self.job.cancel.store(true, Ordering::Relaxed);
    }

    pub fn result(&self) -> CallResult<Arc<PcrResults>> {
        let state = self.job.state.lock().expect("pcr state mutex poisoned");
        if state.cancelled {
            return Err(CallError::new("PCR was cancelled"));
        }
        state
            .result
            .clone()
            .ok_or_else(|| CallError::new("PCR is still running"))
    }

    pub(super) fn describe(&self) -> String {
        let status = self.status();
        if status.cancelled {
            "cancelled".to_string()
        } else if status.done {
            "done".to_string()
        } else {
            format!("{:.0}%", status.percent)
        }
    }

    pub(super) fn call(&mut self, method: &str, _args: &mut Args) -> CallResult<Output> {
        match method {
            "get_status" => Output::value(self.status()),
            "get_settings" => Output::value(self.job.settings),
            "cancel" => {
                self.cancel();
                Output::unit()
            }
            "get_result" => Ok(Output::Object(WorkerObject::PcrResults(self.result()?))),
            _ => Err(CallError::no_method("Pcrer", method)),
        }
    }
}

#[derive(Debug)]
pub struct PcrResults {
    template: Arc<Sequence>,
    primers: Vec<Primer>,
    sites: Vec<Site>,
    products: Vec<Product>,
}

#[derive(Debug, Clone, Copy)]
struct Product {
    fwd: usize,
    rev: usize,
    start: usize,
    end: usize,
}

impl PcrResults {
    fn collect(
        template: Arc<Sequence>,
        primers: Vec<Primer>,
        sites: &[Site],
        settings: &PcrSettings,
    ) -> Self {
        let mut products = Vec::new();
        for fwd in sites.iter().filter(|s| s.fwd) {
            for rev in sites.iter().filter(|s| !s.fwd) {
                let end = rev.start + rev.len;
                if end <= fwd.start {
                    continue;
                }
                let len = end - fwd.start;
                if (settings.min_len..=settings.max_len).contains(&len) {
                    products.push(Product {
                        fwd: fwd.primer,
                        rev: rev.primer,
                        start: fwd.start,
                        end,
                    });
                }
            }
        }
        products.sort_by_key(|p| (p.start, p.end));
        Self {
            template,
            primers,
            sites: sites.to_vec(),
            products,
        }
    }

    pub fn product_count(&self) -> usize {
        self.products.len()
    }

    pub fn matches(&self) -> Vec<PcrMatch> {
        self.sites
            .iter()
            .map(|site| PcrMatch {
                primer: self.primers[site.primer].name.clone(),
                start: site.start,
                len: site.len,
                fwd: site.fwd,
            })
            .collect()
    }

    pub fn products(&self) -> Vec<PcrProduct> {
        self.products
            .iter()
            .map(|p| PcrProduct {
                primer_fwd: self.primers[p.fwd].name.clone(),
                primer_rev: self.primers[p.rev].name.clone(),
                start: p.start,
                end: p.end,
                len: p.end - p.start,
            })
            .collect()
    }

    pub fn extract_product(&self, idx: usize) -> CallResult<Sequence> {
        let product = self
            .products
            .get(idx)
            .ok_or_else(|| CallError::new(format!("No product {}", idx)))?;
        let mut seq = self.template.extract_range(product.start, product.end)?;
        seq.name = Some(format!(
            "{}-{} product",
            self.primers[product.fwd].name, self.primers[product.rev].name
        ));
        Ok(seq)
    }
}

pub(super) fn call_results(
    results: &Arc<PcrResults>,
    method: &str,
    args: &mut Args,
) -> CallResult<Output> {
    match method {
        "get_matches" => Output::value(results.matches()),
        "get_products" => Output::value(results.products()),
        "extract_product" => {
            let idx: usize = args.value(0)?;
            Ok(Output::Object(WorkerObject::Seq(Arc::new(
                results.extract_product(idx)?,
            ))))
        }
        _ => Err(CallError::no_method("PcrResults", method)),
    }
}
