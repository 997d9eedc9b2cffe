//! reCAPTCHA parameters of the Flow product

/// reCAPTCHA Enterprise site key served on labs.google Flow pages
pub const RECAPTCHA_SITE_KEY: &str = "6LdsFiUsAAAAAIjVDZcuLhaHiDn5nnHVXVRQGeMV";

/// Action name the product passes to `grecaptcha.enterprise.execute`
pub const RECAPTCHA_ACTION: &str = "FLOW_GENERATION";

/// Default number of solve attempts per refresh (solving services are paid)
pub const DEFAULT_MAX_SOLVE_ATTEMPTS: u32 = 3;
