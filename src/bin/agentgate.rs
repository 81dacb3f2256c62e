fn main() -> anyhow::Result<()> {
    agentgate::cli::run()
}
