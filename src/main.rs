fn main() -> anyhow::Result<()> {
    stormledger::run()?;
    Ok(())
}
