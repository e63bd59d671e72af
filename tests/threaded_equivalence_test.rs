//! Running every chain in its own worker thread, with swaps negotiated over channels, gives the
//! same samples as the in-process sampler.

use pt_mcmc::config::RunConfig;
use pt_mcmc::distributions::{Gaussian, Posterior, UniformBox};
use pt_mcmc::io::MemorySink;
use pt_mcmc::sampler::{InitialState, PtSampler};

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler(config: RunConfig) -> PtSampler<Posterior<Gaussian, UniformBox>> {
        let target = Posterior::new(Gaussian::standard(3), UniformBox::cube(3, -8.0, 8.0));
        PtSampler::new(target, config, InitialState::Shared(vec![0.5, 0.0, -0.5])).unwrap()
    }

    fn config() -> RunConfig {
        let mut config = RunConfig {
            n_chains: 4,
            total_iterations: 2_000,
            burn_in: 400,
            thin: 2,
            seed: 7,
            record_hot_chains: true,
            transport_timeout_ms: Some(30_000),
            ..RunConfig::default()
        };
        config.ladder.adapt.batch_size = 4;
        config
    }

    #[test]
    fn threaded_run_matches_in_process_run() {
        let local_sink = MemorySink::new();
        let mut local = sampler(config()).with_sink(local_sink.clone());
        let expected = local.run().unwrap();

        let threaded_sink = MemorySink::new();
        let mut threaded = sampler(config()).with_sink(threaded_sink.clone());
        let output = threaded.run_threaded().unwrap();

        assert_eq!(output.samples, expected.samples);
        assert_eq!(output.diagnostics, expected.diagnostics);
        assert_eq!(threaded_sink.records(), local_sink.records());
        assert_eq!(threaded.iteration(), 2_000);
        assert_eq!(
            threaded.ladder().temperatures(),
            local.ladder().temperatures()
        );
        for (a, b) in threaded.chains().iter().zip(local.chains()) {
            assert_eq!(a.state(), b.state());
            assert_eq!(a.temperature(), b.temperature());
        }
    }

    #[test]
    fn threaded_run_resumes_after_in_process_run() {
        let mut expected = sampler(config());
        let full = expected.run().unwrap();

        let mut mixed = sampler(config());
        let head = mixed.run_until(1_000).unwrap();
        let tail = mixed.run_threaded().unwrap();

        let mut joined = head.samples;
        joined.extend(tail.samples);
        assert_eq!(joined, full.samples);
    }

    #[test]
    fn stop_request_is_honoured_by_every_worker() {
        let mut threaded = sampler(config());
        threaded
            .stop_handle()
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let output = threaded.run_threaded().unwrap();
        assert!(output.diagnostics.stopped_early);
        assert!(output.samples.is_empty());
        assert_eq!(threaded.iteration(), 0);
        assert_eq!(threaded.chains().len(), 4);
    }
}
