//! Runs in its own process: clearing the environment would race other tests.

use render_proxy::lifecycle::clear_environment;

#[test]
fn clear_environment_removes_every_variable() {
    std::env::set_var("RENDER_PROXY_SECRET", "hunter2");
    std::env::set_var("PATH", "/usr/bin");

    let removed = clear_environment();

    assert!(removed >= 2);
    assert!(std::env::var_os("RENDER_PROXY_SECRET").is_none());
    assert!(std::env::var_os("PATH").is_none());
    assert_eq!(std::env::vars_os().count(), 0);
    assert_eq!(clear_environment(), 0);
}
