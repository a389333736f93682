//! Command Rebuilder - the `#S` line's command text
//!
//! Reconstructs the invocation that produced a run from its start document:
//!
//! ```text
//! plan_name(arg1=<literal>, arg2=<literal>, ...)
//! ```
//!
//! Argument values go through the [value renderer](crate::value), so the
//! result is a single line no matter how large or deeply nested the
//! arguments are.
//!
//! Three arguments are substituted before rendering, mirroring how the run
//! engine records them:
//!
//! - `detectors` renders the start document's `detectors` name list
//! - any argument named `motor*` renders the start document's `motors` list
//! - device representations anywhere (notably in positional `args`) render
//!   as the device name

use crate::document::StartDoc;
use crate::value::{escape, ArgValue};

/// Build the command text for a run.
pub fn rebuild(start: &StartDoc) -> String {
    let plan_name = start.plan_name.as_deref().unwrap_or_default();
    let args: Vec<(String, ArgValue)> = start
        .plan_args
        .iter()
        .flatten()
        .map(|(name, value)| {
            let source = substitute(start, name).unwrap_or(value);
            (name.clone(), ArgValue::from_json(source))
        })
        .collect();
    rebuild_command(plan_name, &args)
}

/// Build command text from a plan name and already-normalized arguments.
///
/// An [`ArgValue::Opaque`] argument renders as its placeholder; the others are
/// unaffected.
pub fn rebuild_command(plan_name: &str, args: &[(String, ArgValue)]) -> String {
    let rendered: Vec<String> = args
        .iter()
        .map(|(name, value)| format!("{}={}", escape(name), value.render()))
        .collect();
    format!("{}({})", escape(plan_name), rendered.join(", "))
}

fn substitute<'a>(start: &'a StartDoc, arg_name: &str) -> Option<&'a serde_json::Value> {
    if arg_name == "detectors" {
        start.detectors.as_ref()
    } else if arg_name.starts_with("motor") {
        start.motors.as_ref()
    } else {
        None
    }
}
