//! Remote event handlers of the account actor.
//!
//! Each submodule adds an `impl AccountActor` block for one resource kind.
//! Handlers publish on the account's connectors and wait for the local
//! store to acknowledge before returning, so the next event observes the
//! result of the previous one.
//!
//! | Module      | Events                                        |
//! |-------------|-----------------------------------------------|
//! | `addresses` | address created/updated/deleted               |
//! | `labels`    | label created/updated/deleted                 |
//! | `messages`  | message created/updated/flags/deleted         |

mod addresses;
mod labels;
mod messages;
