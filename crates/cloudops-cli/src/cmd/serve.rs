use std::path::Path;

pub fn run(root: &Path, port: u16, external_trigger: bool) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let root_buf = root.to_path_buf();

    rt.block_on(async move {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        let actual_port = listener.local_addr()?.port();
        println!("cloudops server for {} → http://localhost:{actual_port}", root_buf.display());

        tokio::select! {
            res = cloudops_server::serve_on(root_buf, listener, external_trigger) => res,
            _ = tokio::signal::ctrl_c() => Ok(()),
        }
    })
}
