//! Routing Integration Tests
//!
//! Tests for task routing determinism and the sequential fallback chain.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_test::{assert_err, assert_ok};
use vidcore::adapters::{ProviderError, ProviderId, ProviderRegistry};
use vidcore::core::{AiDispatcher, FallbackOrder, RoutingTable, Task, TaskKind, TaskRouter};

fn fail(provider: ProviderId) -> ProviderError {
    ProviderError::Other {
        provider,
        message: "simulated outage".to_string(),
    }
}

#[test]
fn test_route_is_total_and_deterministic() {
    let router = TaskRouter::default();

    for kind in TaskKind::ALL {
        let first = router.route(kind);
        assert!(ProviderId::ALL.contains(&first));
        for _ in 0..10 {
            assert_eq!(router.route(kind), first, "route for {} changed", kind);
        }
    }
}

#[test]
fn test_fallback_order_is_global() {
    let router = TaskRouter::default();

    // Analytical tasks start on OpenAI, then walk the global order without it
    assert_eq!(
        router.plan(TaskKind::AnalyzeVideo),
        vec![ProviderId::OpenAi, ProviderId::Claude, ProviderId::Gemini]
    );
    // Processing tasks start on Gemini
    assert_eq!(
        router.plan(TaskKind::ExtractTags),
        vec![ProviderId::Gemini, ProviderId::Claude, ProviderId::OpenAi]
    );
    assert_eq!(
        router.fallback_chain(&[ProviderId::Claude]),
        vec![ProviderId::OpenAi, ProviderId::Gemini]
    );
}

#[tokio::test]
async fn test_no_provider_attempted_twice_for_any_failure_pattern() {
    let router = TaskRouter::default();
    let order = FallbackOrder::standard();

    for kind in TaskKind::ALL {
        // Every subset of failing providers
        for mask in 0u8..8 {
            let failing: HashSet<ProviderId> = ProviderId::ALL
                .into_iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, p)| p)
                .collect();

            let mut attempts: Vec<ProviderId> = Vec::new();
            let result = router
                .resolve_with_fallback(kind, |provider| {
                    attempts.push(provider);
                    let fails = failing.contains(&provider);
                    async move {
                        if fails {
                            Err(fail(provider))
                        } else {
                            Ok(provider)
                        }
                    }
                })
                .await;

            let unique: HashSet<ProviderId> = attempts.iter().copied().collect();
            assert_eq!(unique.len(), attempts.len(), "{} retried a provider", kind);

            let primary = router.route(kind);
            assert_eq!(attempts[0], primary);

            // Remaining attempts follow the global order with the primary removed
            let expected_tail = order.without(&[primary]);
            assert_eq!(&attempts[1..], &expected_tail[..attempts.len() - 1]);

            match result {
                Ok(resolution) => {
                    assert_eq!(Some(&resolution.provider), attempts.last());
                    assert_eq!(resolution.output, resolution.provider);
                    assert_eq!(resolution.failures.len(), attempts.len() - 1);
                    assert!(!failing.contains(&resolution.provider));
                }
                Err(exhausted) => {
                    assert_eq!(failing.len(), 3);
                    assert_eq!(exhausted.attempted(), attempts);
                }
            }
        }
    }
}

#[tokio::test]
async fn test_all_three_failing_reports_each_provider() {
    let router = TaskRouter::default();

    let result = router
        .resolve_with_fallback(TaskKind::GenerateIdeas, |provider| async move {
            Err::<String, _>(fail(provider))
        })
        .await;

    let exhausted = assert_err!(result);
    assert_eq!(exhausted.task, TaskKind::GenerateIdeas);
    assert_eq!(
        exhausted.attempted(),
        vec![ProviderId::Claude, ProviderId::OpenAi, ProviderId::Gemini]
    );
    assert!(exhausted.to_string().contains("simulated outage"));
}

#[tokio::test]
async fn test_fallback_succeeds_after_primary_failure() {
    let router = TaskRouter::default();

    let result = router
        .resolve_with_fallback(TaskKind::GenerateTitle, |provider| async move {
            match provider {
                ProviderId::Claude => Err(fail(provider)),
                other => Ok(format!("title from {}", other)),
            }
        })
        .await;

    let resolution = assert_ok!(result);
    assert_eq!(resolution.provider, ProviderId::OpenAi);
    assert_eq!(resolution.output, "title from openai");
    assert!(resolution.fell_back());
}

#[tokio::test]
async fn test_custom_routing_keeps_global_fallback() {
    let table = RoutingTable::by_category(ProviderId::Gemini, ProviderId::Gemini, ProviderId::Gemini);
    let router = TaskRouter::new(table, FallbackOrder::standard());

    assert_eq!(
        router.plan(TaskKind::ChatResponse),
        vec![ProviderId::Gemini, ProviderId::Claude, ProviderId::OpenAi]
    );
}

#[tokio::test]
async fn test_dispatcher_without_credentials_fails_fast() {
    let dispatcher = AiDispatcher::new(TaskRouter::default(), Arc::new(ProviderRegistry::empty()));

    let exhausted = assert_err!(dispatcher.complete(&Task::new(TaskKind::QuickSummary, "text")).await);

    assert_eq!(exhausted.failures.len(), 3);
    assert!(exhausted.failures.iter().all(|f| f.error.is_configuration()));
}
