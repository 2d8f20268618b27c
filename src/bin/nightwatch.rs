fn main() -> anyhow::Result<()> {
    nightwatch::nw::cli::run()
}
