#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadPayload,
    UnknownJobType,
    ClassifierUnavailable,
    ClassifierMalformed,
    Database,
    Timeout,
    Panic,
    LeaseExpired,
    Internal,
    Unknown,
}

impl ErrorCode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "BAD_PAYLOAD" => Self::BadPayload,
            "UNKNOWN_JOB_TYPE" => Self::UnknownJobType,
            "CLASSIFIER_UNAVAILABLE" => Self::ClassifierUnavailable,
            "CLASSIFIER_MALFORMED" => Self::ClassifierMalformed,
            "DATABASE" => Self::Database,
            "TIMEOUT" => Self::Timeout,
            "PANIC" => Self::Panic,
            "LEASE_EXPIRED" => Self::LeaseExpired,
            "INTERNAL" => Self::Internal,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadPayload => "BAD_PAYLOAD",
            Self::UnknownJobType => "UNKNOWN_JOB_TYPE",
            Self::ClassifierUnavailable => "CLASSIFIER_UNAVAILABLE",
            Self::ClassifierMalformed => "CLASSIFIER_MALFORMED",
            Self::Database => "DATABASE",
            Self::Timeout => "TIMEOUT",
            Self::Panic => "PANIC",
            Self::LeaseExpired => "LEASE_EXPIRED",
            Self::Internal => "INTERNAL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Operator hint shown next to a failed job.
pub fn suggested_action(code: &str) -> &'static str {
    match ErrorCode::parse(code) {
        ErrorCode::BadPayload => {
            "Producer sent an invalid payload. Fix the producer and enqueue a new job."
        }
        ErrorCode::UnknownJobType => {
            "No handler is registered for this job type. Check the worker version and job_type."
        }
        ErrorCode::ClassifierUnavailable => {
            "Classifier call failed. Check endpoint health/credentials, then re-enqueue the import."
        }
        ErrorCode::ClassifierMalformed => {
            "Classifier returned an unusable response. Inspect last_error; earlier batches are kept, re-enqueue to finish."
        }
        ErrorCode::Database => {
            "Store error. Check database health; re-enqueue once resolved (categorization is idempotent)."
        }
        ErrorCode::Timeout => "Handler exceeded its timeout. Reduce batch size or raise the timeout.",
        ErrorCode::Panic => "Handler panicked. Capture logs for this job id and investigate.",
        ErrorCode::LeaseExpired => {
            "Job stayed running past the stale threshold too many times. Likely a crashing worker."
        }
        ErrorCode::Internal | ErrorCode::Unknown => "Inspect last_error and worker logs.",
    }
}
