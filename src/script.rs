use deadpool_redis::redis::Script;

/// Source of the dispatch script. Every broker mutation funnels through this
/// one script so Redis applies each operation's multi-key effects atomically;
/// concurrent workers never observe partial state.
pub(crate) const DISPATCH_LUA: &str = include_str!("dispatch.lua");

pub(crate) fn dispatch_script() -> Script {
    Script::new(DISPATCH_LUA)
}
