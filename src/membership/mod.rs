pub mod config;
pub mod message;
pub mod processor;
pub(crate) mod state;
pub(crate) mod timers;
pub mod view;

pub use config::*;
pub use message::*;
pub use processor::{Processor, ProcessorView};
pub use state::Status;
pub use view::*;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        common::id::ProcessorId,
        network::{channel::Channel, config::ChannelConfig},
    };

    const SECOND: Duration = Duration::from_secs(1);

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("warn")
            .with_test_writer()
            .try_init();
    }

    fn ids(raw: &[u64]) -> Vec<ProcessorId> {
        raw.iter().copied().map(ProcessorId).collect()
    }

    fn group(channel: &Channel, n: usize, config: ProcessorConfig) -> Vec<Processor> {
        (0..n)
            .map(|_| {
                let processor = Processor::new(channel, config).unwrap();
                channel.register_processor(&processor).unwrap();
                processor
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_join() {
        init_tracing();

        // Arrange: 3 processors with 5s delay bounds and perfectly synchronized clocks
        let channel = Channel::new(ChannelConfig::new(5 * SECOND, 5 * SECOND).with_seed(1));
        let config = ProcessorConfig::new(Duration::ZERO, 3 * SECOND, HeartbeatPolicy::PeriodicBroadcast);
        let processors = group(&channel, 3, config);

        // Act: processor 1 starts a group and the join round plays out
        processors[0].init_join();
        tokio::time::sleep(2 * (5 * SECOND) + 3 * SECOND).await;

        // Assert: every processor sees the same group with the same epoch
        for processor in &processors {
            assert_eq!(processor.members(), ids(&[1, 2, 3]), "{}", processor);
            assert_eq!(processor.epoch(), processors[0].epoch());
        }

        // Act: let heartbeats run for a while
        tokio::time::sleep(30 * SECOND).await;

        // Assert: no check-in was missed, so nobody re-joined
        for processor in &processors {
            assert_eq!(processor.members(), ids(&[1, 2, 3]));
            assert_eq!(processor.view().rounds, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_crash_is_detected() {
        init_tracing();

        // Arrange: the same group as above, joined
        let channel = Channel::new(ChannelConfig::new(5 * SECOND, 5 * SECOND).with_seed(2));
        let config = ProcessorConfig::new(Duration::ZERO, 3 * SECOND, HeartbeatPolicy::PeriodicBroadcast);
        let processors = group(&channel, 3, config);
        processors[0].init_join();
        tokio::time::sleep(6 * SECOND).await;

        // Act: processor 2 crashes before the first heartbeat
        processors[1].crash();
        tokio::time::sleep(34 * SECOND).await;

        // Assert: the survivors re-joined without it
        assert_eq!(processors[1].status(), Status::Crashed);
        assert!(processors[1].members().is_empty());
        for survivor in [&processors[0], &processors[2]] {
            assert_eq!(survivor.status(), Status::Normal);
            assert_eq!(survivor.members(), ids(&[1, 3]), "{}", survivor);
            assert!(survivor.view().rounds >= 2);
        }
        assert!(channel.dropped_messages() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skewed_clocks_converge() {
        init_tracing();

        let channel = Channel::new(ChannelConfig::new(SECOND, SECOND).with_seed(3));
        let config = ProcessorConfig::new(SECOND / 2, 4 * SECOND, HeartbeatPolicy::PeriodicBroadcast);
        let processors = group(&channel, 4, config);

        processors[0].init_join();
        let mut view = processors[3].subscribe();
        tokio::time::timeout(4 * SECOND, view.wait_for(|view| view.members.len() == 4))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(4 * SECOND).await;

        for processor in &processors {
            assert_eq!(processor.members(), ids(&[1, 2, 3, 4]), "{}", processor);
        }

        // Epochs only move forward, and heartbeats keep the group intact.
        let mut last_epochs: Vec<_> = processors.iter().map(|processor| processor.epoch()).collect();
        for _ in 0..20 {
            tokio::time::sleep(SECOND).await;
            for (processor, last) in processors.iter().zip(last_epochs.iter_mut()) {
                let epoch = processor.epoch();
                assert!(epoch >= *last, "epoch of {} went back from {:?} to {:?}", processor, last, epoch);
                *last = epoch;
            }
        }
        for processor in &processors {
            assert_eq!(processor.members(), ids(&[1, 2, 3, 4]));
            assert_eq!(processor.view().rounds, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_join_is_idempotent() {
        init_tracing();

        let channel = Channel::with_bounds(SECOND, SECOND);
        let processor = group(&channel, 1, ProcessorConfig::default()).remove(0);

        processor.init_join();
        processor.init_join();
        tokio::time::sleep(20 * SECOND).await;

        assert_eq!(processor.members(), ids(&[1]));
        assert_eq!(processor.view().rounds, 2);
        assert_eq!(processor.status(), Status::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attendance_ring_keeps_healthy_group() {
        init_tracing();

        let channel = Channel::new(ChannelConfig::new(SECOND, SECOND).with_seed(4));
        let config = ProcessorConfig::new(Duration::ZERO, 5 * SECOND, HeartbeatPolicy::AttendanceList);
        let processors = group(&channel, 3, config);

        processors[0].init_join();
        tokio::time::sleep(30 * SECOND).await;

        for processor in &processors {
            assert_eq!(processor.members(), ids(&[1, 2, 3]), "{}", processor);
            assert_eq!(processor.view().rounds, 1);
            assert_eq!(processor.policy(), HeartbeatPolicy::AttendanceList);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attendance_ring_detects_crash() {
        init_tracing();

        let channel = Channel::new(ChannelConfig::new(SECOND, SECOND).with_seed(5));
        let config = ProcessorConfig::new(Duration::ZERO, 5 * SECOND, HeartbeatPolicy::AttendanceList);
        let processors = group(&channel, 3, config);
        processors[0].init_join();
        tokio::time::sleep(3 * SECOND).await;
        assert_eq!(processors[1].members(), ids(&[1, 2, 3]));

        // The token dies with processor 2 at the next tick.
        processors[1].crash();
        tokio::time::sleep(40 * SECOND).await;

        for survivor in [&processors[0], &processors[2]] {
            assert_eq!(survivor.members(), ids(&[1, 3]), "{}", survivor);
            assert!(survivor.view().rounds >= 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_on_crashed_processor_is_ignored() {
        init_tracing();

        let channel = Channel::with_bounds(SECOND, SECOND);
        let processors = group(&channel, 2, ProcessorConfig::default());

        processors[0].crash();
        processors[0].init_join();
        processors[1].init_join();
        tokio::time::sleep(10 * SECOND).await;

        assert!(processors[0].members().is_empty());
        assert_eq!(processors[0].view().rounds, 0);
        assert_eq!(processors[1].members(), ids(&[2]));
    }

    /// Runs the 3-processor, 5s bound, 3s period group under `policy` and
    /// returns it once `crash` (if any) has been applied and the dust settled.
    async fn slow_group(seed: u64, policy: HeartbeatPolicy, crash: Option<usize>) -> (Channel, Vec<Processor>) {
        let channel = Channel::new(ChannelConfig::new(5 * SECOND, 5 * SECOND).with_seed(seed));
        let config = ProcessorConfig::new(Duration::ZERO, 3 * SECOND, policy);
        let processors = group(&channel, 3, config);

        processors[0].init_join();
        tokio::time::sleep(12 * SECOND).await;
        if let Some(victim) = crash {
            processors[victim].crash();
        }
        tokio::time::sleep(120 * SECOND).await;
        (channel, processors)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_network_keeps_healthy_group_across_seeds() {
        init_tracing();

        for policy in [HeartbeatPolicy::PeriodicBroadcast, HeartbeatPolicy::AttendanceList] {
            for seed in 0..20 {
                let (channel, processors) = slow_group(seed, policy, None).await;
                for processor in &processors {
                    assert_eq!(processor.members(), ids(&[1, 2, 3]), "seed {} {:?}: {}", seed, policy, processor);
                    assert_eq!(processor.view().rounds, 1, "seed {} {:?}: {}", seed, policy, processor);
                }
                channel.close();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_network_detects_crash_across_seeds() {
        init_tracing();

        for policy in [HeartbeatPolicy::PeriodicBroadcast, HeartbeatPolicy::AttendanceList] {
            for seed in 0..20 {
                let (channel, processors) = slow_group(seed, policy, Some(1)).await;
                for survivor in [&processors[0], &processors[2]] {
                    assert_eq!(survivor.members(), ids(&[1, 3]), "seed {} {:?}: {}", seed, policy, survivor);
                    assert!(survivor.view().rounds >= 2);
                }
                channel.close();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_rejected() {
        let channel = Channel::with_bounds(SECOND, SECOND);
        let config = ProcessorConfig::new(SECOND, Duration::ZERO, HeartbeatPolicy::PeriodicBroadcast);

        assert_eq!(
            Processor::new(&channel, config).unwrap_err(),
            crate::common::error::ConfigError::ZeroCheckInPeriod
        );
    }

    mod properties {
        use std::future::Future;

        use proptest::prelude::*;

        use super::*;

        fn simulate<F: Future>(future: F) -> F::Output {
            tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap()
                .block_on(future)
        }

        #[derive(Clone, Copy, Debug)]
        struct Scenario {
            seed: u64,
            processors: usize,
            delay_bound: Duration,
            max_clock_sync_error: Duration,
            check_in_period: Duration,
            policy: HeartbeatPolicy,
        }

        impl Scenario {
            fn join_window(&self) -> Duration {
                self.delay_bound + self.max_clock_sync_error
            }

            /// Time for every member of a ring to see the token or time out.
            fn ring_timeout(&self) -> Duration {
                self.delay_bound * self.processors as u32 + self.max_clock_sync_error
            }

            /// Bound of the convergence law: 2(δ + ε) + P after a join.
            fn convergence(&self) -> Duration {
                2 * self.join_window() + self.check_in_period
            }

            fn start(&self) -> (Channel, Vec<Processor>) {
                let channel = Channel::new(ChannelConfig::new(self.delay_bound, self.delay_bound).with_seed(self.seed));
                let config = ProcessorConfig::new(self.max_clock_sync_error, self.check_in_period, self.policy);
                let processors = group(&channel, self.processors, config);
                (channel, processors)
            }
        }

        fn scenario() -> impl Strategy<Value = Scenario> {
            (
                any::<u64>(),
                2usize..=5,
                1u64..=5,
                0u64..=1000,
                500u64..=8000,
                prop_oneof![
                    Just(HeartbeatPolicy::PeriodicBroadcast),
                    Just(HeartbeatPolicy::AttendanceList)
                ],
            )
                .prop_map(|(seed, processors, bound, skew, period, policy)| Scenario {
                    seed,
                    processors,
                    delay_bound: Duration::from_secs(bound),
                    max_clock_sync_error: Duration::from_millis(skew),
                    check_in_period: Duration::from_millis(period),
                    policy,
                })
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(24))]

            #[test]
            fn prop_healthy_group_converges_and_stays(scenario in scenario()) {
                simulate(async move {
                    let (channel, processors) = scenario.start();
                    let all: Vec<ProcessorId> = processors.iter().map(|processor| processor.id()).collect();

                    processors[0].init_join();
                    tokio::time::sleep(scenario.convergence()).await;
                    for processor in &processors {
                        assert_eq!(processor.members(), all, "{:?}: {}", scenario, processor);
                    }

                    tokio::time::sleep(10 * scenario.check_in_period + scenario.ring_timeout()).await;
                    for processor in &processors {
                        assert_eq!(processor.members(), all, "{:?}: {}", scenario, processor);
                        assert_eq!(processor.view().rounds, 1, "{:?}: {}", scenario, processor);
                    }
                    channel.close();
                });
            }

            #[test]
            fn prop_crashed_member_is_excluded(scenario in scenario(), victim in any::<prop::sample::Index>()) {
                simulate(async move {
                    let (channel, processors) = scenario.start();
                    let victim = victim.index(processors.len());

                    processors[0].init_join();
                    tokio::time::sleep(scenario.convergence()).await;
                    processors[victim].crash();

                    let detection = 2 * scenario.check_in_period + scenario.ring_timeout().max(scenario.join_window());
                    tokio::time::sleep(2 * detection + 4 * scenario.convergence() + 10 * SECOND).await;

                    let survivors: Vec<&Processor> = processors
                        .iter()
                        .filter(|processor| !processor.is_crashed())
                        .collect();
                    let expected: Vec<ProcessorId> = survivors.iter().map(|processor| processor.id()).collect();
                    assert_eq!(survivors.len(), scenario.processors - 1);
                    for survivor in &survivors {
                        assert_eq!(survivor.members(), expected, "{:?}: {}", scenario, survivor);
                        assert!(survivor.view().rounds >= 2);
                    }
                    channel.close();
                });
            }
        }
    }
}
