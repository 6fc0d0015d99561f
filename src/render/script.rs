//! Fixed pieces of the renderer driver script.

/// User agent used when the request does not carry one.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/31.0.1650.63 Safari/537.36";

/// Accept header used when the request does not carry one.
pub const DEFAULT_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";

/// Page creation and settings shared by every script.
pub const SETUP: &str = "var page = require('webpage').create();
page.settings.resourceTimeout = 10000;
page.onResourceError = function (error) {
    console.log('resource error: ' + error.url + ' ' + error.errorString);
};
";

/// Plain page load.
pub const LOAD: &str = "page.open(url, function (status) {
    console.log('load finished: ' + status);
    phantom.exit(status === 'success' ? 0 : 1);
});
";

/// Page load submitting `data` as a POST body.
pub const LOAD_POST: &str = "page.open(url, 'post', data, function (status) {
    console.log('load finished: ' + status);
    phantom.exit(status === 'success' ? 0 : 1);
});
";
