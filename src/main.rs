fn main() -> anyhow::Result<()> {
    teapot_lib::run()
}
