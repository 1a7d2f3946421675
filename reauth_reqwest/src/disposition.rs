//! Deciding what to do with a response

use reqwest::StatusCode;

/// Which attempt of a logical request a response answers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RequestAttempt {
    /// The request as the caller sent it
    Initial,
    /// The single resubmission made after renewing the session
    Replay,
}

/// How an outgoing request was credentialed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Credential {
    /// The session's access token was attached
    Session,
    /// The session had no access token to attach
    Anonymous,
    /// The caller supplied its own `Authorization` header
    Caller,
    /// The request did not satisfy the attachment predicate
    Excluded,
}

/// Why a failed response was handed back to the caller untouched
///
/// Responses passed through by the middleware carry this value in their
/// extensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// The failure was not an authentication failure
    NonAuth,
    /// The request had already been replayed once after a renewal
    AlreadyRetried,
    /// No user was logged in, so there was nothing to renew
    NoSession,
    /// The rejected credential was supplied by the caller, not the session
    CallerCredential,
    /// The request was not eligible for the session's token
    Excluded,
    /// The request body could not be copied for a replay
    NotReplayable,
}

/// What the middleware does with a response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// The response is not a failure
    Deliver,
    /// The failure goes back to the caller as-is
    PassThrough(FailureKind),
    /// Renew the session and replay the request
    Renew,
}

/// The facts about one request/response exchange needed to decide its fate
#[derive(Clone, Copy, Debug)]
pub(crate) struct Exchange {
    pub status: StatusCode,
    pub attempt: RequestAttempt,
    pub credential: Credential,
    pub replayable: bool,
    pub logged_in: bool,
}

impl Exchange {
    pub fn disposition(&self) -> Disposition {
        if !self.status.is_client_error() && !self.status.is_server_error() {
            return Disposition::Deliver;
        }

        let kind = if self.status != StatusCode::UNAUTHORIZED {
            FailureKind::NonAuth
        } else if self.attempt == RequestAttempt::Replay {
            FailureKind::AlreadyRetried
        } else if !self.logged_in {
            FailureKind::NoSession
        } else if self.credential == Credential::Caller {
            FailureKind::CallerCredential
        } else if self.credential == Credential::Excluded {
            FailureKind::Excluded
        } else if !self.replayable {
            FailureKind::NotReplayable
        } else {
            return Disposition::Renew;
        };

        Disposition::PassThrough(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unauthorized() -> Exchange {
        Exchange {
            status: StatusCode::UNAUTHORIZED,
            attempt: RequestAttempt::Initial,
            credential: Credential::Session,
            replayable: true,
            logged_in: true,
        }
    }

    #[test]
    fn first_unauthorized_response_of_a_session_is_renewed() {
        assert_eq!(unauthorized().disposition(), Disposition::Renew);
    }

    #[test]
    fn anonymous_request_of_a_logged_in_session_is_renewed() {
        let exchange = Exchange {
            credential: Credential::Anonymous,
            ..unauthorized()
        };
        assert_eq!(exchange.disposition(), Disposition::Renew);
    }

    #[test]
    fn successes_and_redirects_are_delivered() {
        for status in [StatusCode::OK, StatusCode::NO_CONTENT, StatusCode::FOUND] {
            let exchange = Exchange {
                status,
                ..unauthorized()
            };
            assert_eq!(exchange.disposition(), Disposition::Deliver);
        }
    }

    #[test]
    fn other_failures_pass_through() {
        for status in [
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
            StatusCode::INTERNAL_SERVER_ERROR,
        ] {
            let exchange = Exchange {
                status,
                ..unauthorized()
            };
            assert_eq!(
                exchange.disposition(),
                Disposition::PassThrough(FailureKind::NonAuth)
            );
        }
    }

    #[test]
    fn replayed_request_is_never_renewed_again() {
        let exchange = Exchange {
            attempt: RequestAttempt::Replay,
            ..unauthorized()
        };
        assert_eq!(
            exchange.disposition(),
            Disposition::PassThrough(FailureKind::AlreadyRetried)
        );
    }

    #[test]
    fn logged_out_session_is_not_renewed() {
        let exchange = Exchange {
            logged_in: false,
            ..unauthorized()
        };
        assert_eq!(
            exchange.disposition(),
            Disposition::PassThrough(FailureKind::NoSession)
        );
    }

    #[test]
    fn caller_credentials_are_not_renewed() {
        let exchange = Exchange {
            credential: Credential::Caller,
            ..unauthorized()
        };
        assert_eq!(
            exchange.disposition(),
            Disposition::PassThrough(FailureKind::CallerCredential)
        );
    }

    #[test]
    fn excluded_requests_are_not_renewed() {
        let exchange = Exchange {
            credential: Credential::Excluded,
            ..unauthorized()
        };
        assert_eq!(
            exchange.disposition(),
            Disposition::PassThrough(FailureKind::Excluded)
        );
    }

    #[test]
    fn unclonable_requests_are_not_renewed() {
        let exchange = Exchange {
            replayable: false,
            ..unauthorized()
        };
        assert_eq!(
            exchange.disposition(),
            Disposition::PassThrough(FailureKind::NotReplayable)
        );
    }
}
