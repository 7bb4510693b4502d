//! Status enums stored as text columns, and the transitions allowed between them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An attempted status change that the current status does not allow.
#[derive(Debug, Error)]
#[error("cannot move {entity} from {from} to {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

macro_rules! text_status {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
        #[serde(rename_all = "snake_case")]
        #[sqlx(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_status!(
    /// Lifecycle of a user comment.
    CommentStatus {
        Pending => "pending",
        Approved => "approved",
        Hidden => "hidden",
        Flagged => "flagged",
    }
);

text_status!(
    /// Review state of a Proof-of-Good act.
    GoodActStatus {
        UnderReview => "under_review",
        Verified => "verified",
        Rejected => "rejected",
    }
);

text_status!(
    Verdict {
        Confirm => "confirm",
        Deny => "deny",
        Inconclusive => "inconclusive",
    }
);

text_status!(
    /// Shared by support requests and offers.
    SupportStatus {
        Open => "open",
        Matched => "matched",
        Closed => "closed",
    }
);

text_status!(
    MatchStatus {
        Pending => "pending",
        Accepted => "accepted",
        Declined => "declined",
        Completed => "completed",
    }
);

text_status!(
    SubmissionStatus {
        Pending => "pending",
        Accepted => "accepted",
        Rejected => "rejected",
    }
);

impl CommentStatus {
    /// Whether an accumulation of flags should move the comment into the `flagged` queue.
    ///
    /// Comments already flagged or hidden by a moderator are left alone.
    pub const fn flaggable(self) -> bool {
        !matches!(self, Self::Flagged | Self::Hidden)
    }
}

impl Verdict {
    /// The act status a verdict resolves to. `None` leaves the status unchanged.
    pub const fn resolves_to(self) -> Option<GoodActStatus> {
        match self {
            Self::Confirm => Some(GoodActStatus::Verified),
            Self::Deny => Some(GoodActStatus::Rejected),
            Self::Inconclusive => None,
        }
    }
}

impl MatchStatus {
    /// Validate a move from `self` to `to`.
    pub fn transition(self, to: Self) -> Result<Self, TransitionError> {
        let allowed = matches!(
            (self, to),
            (Self::Pending, Self::Accepted | Self::Declined) | (Self::Accepted, Self::Completed)
        );

        if allowed {
            Ok(to)
        } else {
            Err(TransitionError {
                entity: "support match",
                from: self.as_str(),
                to: to.as_str(),
            })
        }
    }
}

impl SupportStatus {
    /// Owners may close an open or matched request/offer; closed is terminal.
    pub fn close(self) -> Result<Self, TransitionError> {
        if self == Self::Closed {
            Err(TransitionError {
                entity: "support post",
                from: self.as_str(),
                to: Self::Closed.as_str(),
            })
        } else {
            Ok(Self::Closed)
        }
    }
}

impl SubmissionStatus {
    pub fn resolve(self, to: Self) -> Result<Self, TransitionError> {
        if self == Self::Pending && to != Self::Pending {
            Ok(to)
        } else {
            Err(TransitionError {
                entity: "submission",
                from: self.as_str(),
                to: to.as_str(),
            })
        }
    }
}
