//! Integration tests for configuration loading

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use servd::conf::{self, load_dir};
use servd::SvcKind;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_test_dir() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = PathBuf::from(format!("/tmp/servd-conf-test-{}-{}", std::process::id(), id));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_load_dir_full_config() {
    let dir = unique_test_dir();
    fs::write(
        dir.join("10-base.conf"),
        r#"# Base system configuration
runlevel 3
rlimit nofile 1024

run [S] /bin/sh -c "echo boot" -- Boot marker
task [S] /sbin/mkswap /dev/sda2 --
service [2345] log:/var/log/sshd.log /usr/sbin/sshd -D -- SSH daemon
"#,
    )
    .unwrap();
    fs::write(
        dir.join("20-net.conf"),
        r#"service [2345] <net/eth0/up> :eth0 /sbin/udhcpc -i eth0 -- DHCP client
tty [12345] /dev/ttyS0 115200 vt220
"#,
    )
    .unwrap();
    // Non-.conf files are ignored
    fs::write(dir.join("README"), "service /bin/not-loaded\n").unwrap();

    let config = load_dir(&dir).unwrap();

    assert_eq!(config.default_runlevel, Some(3));
    assert_eq!(config.rlimits, vec![("nofile".to_string(), 1024)]);
    assert_eq!(config.stanzas.len(), 5);

    let kinds: Vec<SvcKind> = config.stanzas.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![
            SvcKind::Run,
            SvcKind::Task,
            SvcKind::Service,
            SvcKind::Service,
            SvcKind::Tty
        ]
    );

    // Globals apply to every stanza
    for stanza in &config.stanzas {
        assert_eq!(stanza.rlimits, vec![("nofile".to_string(), 1024)]);
        assert!(stanza.file.is_some());
    }

    let dhcp = &config.stanzas[3];
    assert_eq!(dhcp.instance, "eth0");
    assert_eq!(dhcp.conds, vec!["net/eth0/up"]);

    let tty = &config.stanzas[4];
    assert!(tty.tty.is_some());
    assert_eq!(tty.instance, "ttyS0");
}

#[test]
fn test_load_dir_files_sorted() {
    let dir = unique_test_dir();
    fs::write(dir.join("20-late.conf"), "service /bin/b -- B\n").unwrap();
    fs::write(dir.join("10-early.conf"), "service /bin/a -- A\n").unwrap();

    let config = load_dir(&dir).unwrap();
    assert_eq!(config.stanzas[0].cmd, "/bin/a");
    assert_eq!(config.stanzas[1].cmd, "/bin/b");
}

#[test]
fn test_load_dir_missing() {
    let dir = unique_test_dir().join("not-there");
    assert!(load_dir(&dir).is_err());
}

#[test]
fn test_bad_lines_are_isolated() {
    let dir = unique_test_dir();
    fs::write(
        dir.join("mixed.conf"),
        "service /bin/good -- Good\nservice [nope] /bin/bad\ntask halt:WOBBLE /bin/worse\nrun [S] /bin/alsogood -- Fine\n",
    )
    .unwrap();

    let config = load_dir(&dir).unwrap();
    assert_eq!(config.stanzas.len(), 2);
    assert_eq!(config.stanzas[0].cmd, "/bin/good");
    assert_eq!(config.stanzas[1].cmd, "/bin/alsogood");
}

#[test]
fn test_stanza_text_excludes_description() {
    let mut config = conf::Config::default();
    conf::parse_into(
        &mut config,
        "service /bin/x -- One\nservice /bin/x -- Two\n",
        None,
    );
    assert_eq!(config.stanzas.len(), 2);
    // Same behavior, different description: same identity text
    assert_eq!(config.stanzas[0].text, config.stanzas[1].text);
    assert_ne!(config.stanzas[0].desc, config.stanzas[1].desc);
}
