//! Predicates deciding which requests receive the session's token

use std::fmt;

use predicates::{reflection, Predicate};
use reqwest::Request;

/// Reports the request attribute that made a predicate disagree with `expected`
fn mismatch<'a>(
    predicate: &'a dyn reflection::PredicateReflection,
    expected: bool,
    actual: bool,
    attribute: &'static str,
    value: impl fmt::Display + 'static,
) -> Option<reflection::Case<'a>> {
    if actual == expected {
        return None;
    }

    let case = reflection::Case::new(Some(predicate), actual)
        .add_product(reflection::Product::new(attribute, value));
    Some(case)
}

/// Only attach the session's token to requests sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        mismatch(
            self,
            expected,
            self.eval(req),
            "scheme",
            req.url().scheme().to_owned(),
        )
    }
}

impl reflection::PredicateReflection for HttpsOnly {}

impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach the session's token to requests for exactly this host
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Constructs a predicate matching `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(self.host.as_str())
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let host = req.url().host_str().unwrap_or("<none>").to_owned();
        mismatch(self, expected, self.eval(req), "host", host)
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}

impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host == {}", self.host)
    }
}
