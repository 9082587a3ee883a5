//! 设备身份
//!
//! 每台设备首次启动时生成一次，之后只刷新 `last_active` 或重新生成昵称。

use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::value_objects::{AvatarColor, DeviceId, DisplayName, Timestamp};

const ADJECTIVES: &[&str] = &[
    "Calm", "Gentle", "Quiet", "Brave", "Kind", "Bright", "Warm", "Patient", "Hopeful",
    "Steady", "Curious", "Mellow", "Sunny", "Soft", "Wise", "Cheerful",
];

const ANIMALS: &[&str] = &[
    "Otter", "Fox", "Panda", "Owl", "Dolphin", "Koala", "Robin", "Turtle", "Deer", "Rabbit",
    "Penguin", "Sparrow", "Seal", "Hedgehog", "Lynx", "Crane",
];

const AVATAR_PALETTE: &[&str] = &[
    "#f87171", "#fb923c", "#fbbf24", "#a3e635", "#34d399", "#22d3ee", "#60a5fa", "#818cf8",
    "#c084fc", "#f472b6",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub device_id: DeviceId,
    pub display_name: DisplayName,
    pub avatar_color: AvatarColor,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active: Timestamp,
}

impl Identity {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R, now: Timestamp) -> Self {
        Self {
            device_id: DeviceId::random(),
            display_name: random_display_name(rng),
            avatar_color: random_avatar_color(rng),
            last_active: now,
        }
    }

    pub fn touch(&mut self, now: Timestamp) {
        if now > self.last_active {
            self.last_active = now;
        }
    }

    /// 昵称只是装饰，可以随时重新生成，设备标识保持不变。
    pub fn regenerate_display_name<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.display_name = random_display_name(rng);
    }
}

fn random_display_name<R: Rng + ?Sized>(rng: &mut R) -> DisplayName {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("Quiet");
    let animal = ANIMALS.choose(rng).copied().unwrap_or("Otter");
    // 词表均为非空短词
    DisplayName::from_trusted(format!("{adjective} {animal}"))
}

fn random_avatar_color<R: Rng + ?Sized>(rng: &mut R) -> AvatarColor {
    let color = AVATAR_PALETTE.choose(rng).copied().unwrap_or("#60a5fa");
    AvatarColor::from_trusted(color.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::{Duration, OffsetDateTime};

    #[test]
    fn generated_identity_uses_word_lists() {
        let mut rng = rand::rng();
        let identity = Identity::generate(&mut rng, OffsetDateTime::now_utc());
        let mut words = identity.display_name.as_str().split(' ');
        assert!(ADJECTIVES.contains(&words.next().unwrap()));
        assert!(ANIMALS.contains(&words.next().unwrap()));
        assert!(AVATAR_PALETTE.contains(&identity.avatar_color.as_str()));
    }

    #[test]
    fn regenerate_keeps_device_id() {
        let mut rng = rand::rng();
        let mut identity = Identity::generate(&mut rng, OffsetDateTime::now_utc());
        let device_id = identity.device_id;
        identity.regenerate_display_name(&mut rng);
        assert_eq!(identity.device_id, device_id);
    }

    #[test]
    fn touch_only_moves_forward() {
        let now = OffsetDateTime::now_utc();
        let mut identity = Identity::generate(&mut rand::rng(), now);
        identity.touch(now - Duration::hours(1));
        assert_eq!(identity.last_active, now);
        identity.touch(now + Duration::seconds(5));
        assert_eq!(identity.last_active, now + Duration::seconds(5));
    }
}
