mod rate_limit;
mod requests_logging;

pub use rate_limit::{
    cache_request_body, extract_subject_for_rate_limit, rate_limit_error_handler, CachedBody,
    EmailKeyExtractor, IpKeyExtractor, RateLimitSubject, SubjectOrIpKeyExtractor,
};
pub use rate_limit::{
    GLOBAL_PER_HOUR, GLOBAL_PER_MINUTE, LOGIN_PER_HOUR, LOGIN_PER_MINUTE, OTP_PER_HOUR,
    OTP_PER_MINUTE, TOKEN_PER_HOUR, TOKEN_PER_MINUTE,
};
pub use requests_logging::{log_requests, RequestsLoggingLevel};
