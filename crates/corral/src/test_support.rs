//! Stub helper executables for tests.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Spawner: records the command's output and status in the job directory
/// and runs it in the background.
pub const IOMUX_SPAWN: &str = r#"#!/bin/sh
dir="$1"
shift
: > "$dir/stdout"
: > "$dir/stderr"
echo ready
(
  "$@" > "$dir/stdout" 2> "$dir/stderr"
  echo $? > "$dir/exit_status.tmp"
  mv "$dir/exit_status.tmp" "$dir/exit_status"
) < /dev/null > /dev/null 2>&1 &
echo active
"#;

/// Linker: streams stdout from the cursor, then stderr, then exits with the
/// job's status. Each invocation appends to `link-count`.
pub const IOMUX_LINK: &str = r#"#!/bin/sh
cursors="$2"
dir="$3"
echo linked >> "$dir/link-count"
trap 'exit 130' INT TERM
while :; do
  off=$(cat "$cursors" 2>/dev/null || echo 0)
  size=$(wc -c < "$dir/stdout")
  if [ "$size" -gt "$off" ]; then
    echo "$size" > "$cursors"
    tail -c +$((off + 1)) "$dir/stdout" | head -c $((size - off))
  fi
  if [ -f "$dir/exit_status" ] && [ "$size" -eq "$(wc -c < "$dir/stdout")" ]; then
    cat "$dir/stderr" >&2
    exit "$(cat "$dir/exit_status")"
  fi
  sleep 0.05
done
"#;

/// Launcher: `launch` records its environment and leaves a sleeper
/// standing in for the container init; `exec` runs the command directly.
pub const LAUNCHER: &str = r#"#!/bin/sh
cmd="$1"
shift
case "$cmd" in
launch)
  while [ $# -gt 0 ]; do
    case "$1" in
      --run) run="$2" ;;
    esac
    shift 2
  done
  mkdir -p "$run"
  env | grep -E '^(CONTAINER|NETWORK|ROOTFS)_' > "$run/launch-env"
  sleep 30 < /dev/null > /dev/null 2>&1 &
  echo $! > "$run/pid"
  ;;
exec)
  while [ "$1" != "--" ]; do
    case "$1" in
      --env) export "$2" ;;
    esac
    shift 2
  done
  shift
  exec "$@"
  ;;
*)
  exit 2
  ;;
esac
"#;

/// Create a skeleton directory with stub spawner and linker, and a
/// launcher next to it. Returns `(skeleton, launcher)`.
pub fn stub_skeleton(root: &Path) -> (PathBuf, PathBuf) {
    let skeleton = root.join("skeleton");
    write_script(&skeleton.join("bin").join("iomux-spawn"), IOMUX_SPAWN);
    write_script(&skeleton.join("bin").join("iomux-link"), IOMUX_LINK);
    std::fs::create_dir_all(skeleton.join("lib")).unwrap();
    let launcher = root.join("corral-init");
    write_script(&launcher, LAUNCHER);
    (skeleton, launcher)
}

/// Write an executable script.
pub fn write_script(path: &Path, body: &str) {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).unwrap();
    }
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Create a container directory with stub spawner and linker.
pub fn stub_container(root: &Path) -> PathBuf {
    let path = root.join("container");
    write_script(&path.join("bin").join("iomux-spawn"), IOMUX_SPAWN);
    write_script(&path.join("bin").join("iomux-link"), IOMUX_LINK);
    path
}

/// Number of times the linker ran for a job.
pub fn link_count(container: &Path, id: u32) -> usize {
    std::fs::read_to_string(container.join("jobs").join(id.to_string()).join("link-count"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// `sh -c script` as an argv.
pub fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}
