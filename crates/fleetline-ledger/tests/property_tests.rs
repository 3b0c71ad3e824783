//! Concurrency properties of version allocation

use std::sync::Arc;

use fleetline_ledger::prelude::*;
use proptest::prelude::*;

fn bundle(n: usize) -> ConfigBundle {
    let mut bundle = ConfigBundle::new();
    bundle.insert("n".to_string(), serde_json::json!(n));
    bundle
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_concurrent_proposals_get_gap_free_versions(
        proposals in 1usize..40,
        devices in 1usize..4,
    ) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .build()
            .map_err(|e| TestCaseError::fail(e.to_string()))?;

        let histories = rt.block_on(async {
            let ledger = Arc::new(ConfigurationLedger::in_memory());
            let mut handles = Vec::new();
            for i in 0..proposals {
                let ledger = ledger.clone();
                let device = format!("dev-{}", i % devices);
                handles.push(tokio::spawn(async move {
                    ledger.propose(&device, bundle(i), None).await
                }));
            }
            for handle in handles {
                handle
                    .await
                    .map_err(|e| e.to_string())?
                    .map_err(|e| e.to_string())?;
            }

            let mut histories = Vec::new();
            for device in ledger.devices() {
                histories.push(ledger.history(&device).await);
            }
            Ok::<_, String>(histories)
        }).map_err(TestCaseError::fail)?;

        let total: usize = histories.iter().map(Vec::len).sum();
        prop_assert_eq!(total, proposals);

        for rows in histories {
            let versions: Vec<u64> = rows.iter().map(|r| r.version).collect();
            let expected: Vec<u64> = (1..=rows.len() as u64).collect();
            prop_assert_eq!(versions, expected);
        }
    }
}
