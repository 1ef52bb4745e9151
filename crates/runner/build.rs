//! Build script for RaplMonitor
//! Embeds Windows resource metadata

fn main() {
    #[cfg(windows)]
    {
        let mut res = winresource::WindowsResource::new();
        res.set("FileDescription", "RAPL Monitor");
        res.set("ProductName", "RAPL Monitor");
        res.set("InternalName", "RaplMonitor");
        res.set("OriginalFilename", "RaplMonitor.exe");
        res.set("LegalCopyright", "Copyright © 2026");
        // Ask for the invoker's token; elevation is requested explicitly at runtime
        res.set_manifest(
            r#"<assembly xmlns="urn:schemas-microsoft-com:asm.v1" manifestVersion="1.0">
<trustInfo xmlns="urn:schemas-microsoft-com:asm.v3">
  <security>
    <requestedPrivileges>
      <requestedExecutionLevel level="asInvoker" uiAccess="false" />
    </requestedPrivileges>
  </security>
</trustInfo>
</assembly>"#,
        );

        if let Err(e) = res.compile() {
            println!("cargo:warning=Failed to compile Windows resources: {}", e);
        }
    }
}
