//! Property-based tests for the failure taxonomy.

use fleetline_errors::{ErrorSeverity, FailureClass, ValidationError};
use proptest::prelude::*;

fn any_class() -> impl Strategy<Value = FailureClass> {
    (0usize..FailureClass::ALL.len())
        .prop_map(|i| FailureClass::ALL.get(i).copied().unwrap_or(FailureClass::Cancelled))
}

proptest! {
    #[test]
    fn test_retryable_implies_fallback(class in any_class()) {
        if class.is_retryable() {
            prop_assert!(class.allows_fallback());
        }
    }

    #[test]
    fn test_operator_classes_never_retry_or_fall_back(class in any_class()) {
        if class.requires_operator() {
            prop_assert!(!class.is_retryable());
            prop_assert!(!class.allows_fallback());
            prop_assert_eq!(class.severity(), ErrorSeverity::Critical);
        }
    }

    #[test]
    fn test_validation_error_display_mentions_field(field in "[a-z_.]{1,24}") {
        let err = ValidationError::missing(field.clone());
        prop_assert!(err.to_string().contains(&field));
    }
}
