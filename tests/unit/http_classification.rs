//! Error classification of the HTTP clients

use receipt_batch::services::http::{classify_reported_failure, classify_status};
use receipt_batch::services::{ErrorClass, ExtractionService, HttpExtractionClient};

#[test]
fn test_status_classes() {
    assert_eq!(classify_status(429, "").class(), ErrorClass::RateLimited);
    assert_eq!(classify_status(408, "").class(), ErrorClass::Transient);
    assert_eq!(classify_status(503, "busy").class(), ErrorClass::Transient);
    assert_eq!(classify_status(400, "bad image").class(), ErrorClass::Fatal);
    assert_eq!(classify_status(401, "").class(), ErrorClass::Fatal);
}

#[test]
fn test_status_message_includes_detail() {
    let err = classify_status(503, "  upstream busy ");
    assert_eq!(err.message(), "HTTP 503: upstream busy");
}

#[test]
fn test_reported_failure_classes() {
    assert_eq!(
        classify_reported_failure("Rate limit exceeded").class(),
        ErrorClass::RateLimited
    );
    assert_eq!(
        classify_reported_failure("upstream returned 429").class(),
        ErrorClass::RateLimited
    );
    assert_eq!(
        classify_reported_failure("image could not be decoded").class(),
        ErrorClass::Fatal
    );
}

#[tokio::test]
async fn test_unreachable_endpoint_is_transient() {
    let client = HttpExtractionClient::new("http://127.0.0.1:9/extract", None).unwrap();
    let err = client.extract_text(b"image").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Transient);
}
