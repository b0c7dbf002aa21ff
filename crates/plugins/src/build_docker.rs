use std::sync::OnceLock;

use crate::{HandlerResult, PluginContext, Registry, command::CommandSet, pipeline::run_build};

pub const PLUGIN_NAME: &str = "build-docker";

fn commands() -> &'static CommandSet {
    static COMMANDS: OnceLock<CommandSet> = OnceLock::new();
    COMMANDS.get_or_init(|| CommandSet::new().with("build_docker", "build-docker").unwrap())
}

pub async fn handle(ctx: PluginContext) -> HandlerResult {
    run_build(ctx, PLUGIN_NAME, commands()).await
}

pub fn register(registry: &mut Registry) { registry.register(PLUGIN_NAME, handle) }
