//! eSCL scanner probe
//!
//! Fetches `/eSCL/ScannerCapabilities` and streams the XML with a running
//! element path instead of a DOM, so a pathological capabilities document
//! cannot balloon memory. The result is the `_uscan._tcp` TXT record.

use std::collections::BTreeSet;

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, trace};

use crate::dnssd::DnsSdSvcInfo;
use crate::err::{Error, Result};
use crate::http::{Request, RoundTripper};
use crate::usb::info::UsbDeviceInfo;

// Element paths, written as the raw prefixed names the documents use.
const PATH_UUID: &str = "/scan:ScannerCapabilities/scan:UUID";
const PATH_VERSION: &str = "/scan:ScannerCapabilities/pwg:Version";
const PATH_PLATEN: &str = "/scan:ScannerCapabilities/scan:Platen";
const PATH_ADF: &str = "/scan:ScannerCapabilities/scan:Adf";
const PATH_PLATEN_CAPS: &str = "/scan:ScannerCapabilities/scan:Platen/scan:PlatenInputCaps";
const PATH_ADF_SIMPLEX: &str = "/scan:ScannerCapabilities/scan:Adf/scan:AdfSimplexInputCaps";
const PATH_ADF_DUPLEX: &str = "/scan:ScannerCapabilities/scan:Adf/scan:AdfDuplexCaps";

// Relative to one of the *InputCaps paths above.
const SUBPATH_COLOR_MODE: &str =
    "/scan:SettingProfiles/scan:SettingProfile/scan:ColorModes/scan:ColorMode";
const SUBPATH_DOCUMENT_FORMAT: &str =
    "/scan:SettingProfiles/scan:SettingProfile/scan:DocumentFormats/pwg:DocumentFormat";

/// Probe the scanner side of the device. Returns the `_uscan._tcp`
/// service, or an `escl-error` when the device has no valid scanner.
pub async fn escl_service<T: RoundTripper>(
    rt: &T,
    port: u16,
    usbinfo: &UsbDeviceInfo,
) -> Result<DnsSdSvcInfo> {
    let request = Request::new("GET", "/eSCL/ScannerCapabilities")
        .with_header("Host", format!("localhost:{port}").as_str());

    let response = rt.round_trip(request).await?;
    if !response.is_success() {
        return Err(Error::Escl(format!(
            "HTTP: {} {}",
            response.status, response.reason
        )));
    }
    let xml = response.body.collect().await?;

    let caps = ScannerCaps::decode(&xml)?;
    debug!(
        platen = caps.platen,
        adf = caps.adf,
        duplex = caps.duplex,
        "eSCL capabilities decoded"
    );

    Ok(caps.into_service(port, usbinfo))
}

/// What the TXT record needs from ScannerCapabilities.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScannerCaps {
    uuid: String,
    version: String,
    platen: bool,
    adf: bool,
    duplex: bool,
    /// Color spaces, already mapped to the cs= vocabulary.
    cs: BTreeSet<String>,
    /// Document formats.
    pdl: BTreeSet<String>,
}

impl ScannerCaps {
    /// Streaming decode: maintain a `/prefixed:name/...` path and act on
    /// element opens and text. A capabilities document is valid if it has
    /// a UUID, a version, at least one color mode, at least one format
    /// and at least one input source.
    pub fn decode(xml: &[u8]) -> Result<ScannerCaps> {
        let mut caps = ScannerCaps::default();

        let mut reader = Reader::from_reader(xml);
        let mut buf = Vec::new();
        let mut path = String::new();
        let mut len_stack: Vec<usize> = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    len_stack.push(path.len());
                    path.push('/');
                    path.push_str(&String::from_utf8_lossy(e.name().as_ref()));
                    caps.element(&path);
                }
                Ok(Event::Empty(e)) => {
                    // Self-closing element: open without a matching end.
                    let saved = path.len();
                    path.push('/');
                    path.push_str(&String::from_utf8_lossy(e.name().as_ref()));
                    caps.element(&path);
                    path.truncate(saved);
                }
                Ok(Event::End(_)) => {
                    if let Some(len) = len_stack.pop() {
                        path.truncate(len);
                    }
                }
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::Escl(format!("bad XML text: {e}")))?;
                    let text = text.trim();
                    if !text.is_empty() {
                        trace!(path = %path, text, "eSCL element");
                        caps.data(&path, text);
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(Error::Escl(format!("XML: {e}"))),
            }
            buf.clear();
        }

        caps.validate()?;
        Ok(caps)
    }

    fn element(&mut self, path: &str) {
        match path {
            PATH_PLATEN => self.platen = true,
            PATH_ADF => self.adf = true,
            PATH_ADF_DUPLEX => self.duplex = true,
            _ => {}
        }
    }

    fn data(&mut self, path: &str, text: &str) {
        if path == PATH_UUID {
            if self.uuid.is_empty() {
                self.uuid = text.to_string();
            }
            return;
        }
        if path == PATH_VERSION {
            if self.version.is_empty() {
                self.version = text.to_string();
            }
            return;
        }

        for caps_path in [PATH_PLATEN_CAPS, PATH_ADF_SIMPLEX, PATH_ADF_DUPLEX] {
            let Some(rest) = path.strip_prefix(caps_path) else {
                continue;
            };
            match rest {
                SUBPATH_COLOR_MODE => {
                    let mode = text.to_ascii_lowercase();
                    if mode.starts_with("rgb") {
                        self.cs.insert("color".to_string());
                    } else if mode.starts_with("grayscale") {
                        self.cs.insert("grayscale".to_string());
                    } else if mode.starts_with("blackandwhite") {
                        self.cs.insert("binary".to_string());
                    }
                }
                SUBPATH_DOCUMENT_FORMAT => {
                    self.pdl.insert(text.to_string());
                }
                _ => {}
            }
            return;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.uuid.is_empty()
            || self.version.is_empty()
            || self.cs.is_empty()
            || self.pdl.is_empty()
            || !(self.platen || self.adf)
        {
            return Err(Error::Escl("invalid ScannerCapabilities response".into()));
        }
        Ok(())
    }

    fn into_service(self, port: u16, usbinfo: &UsbDeviceInfo) -> DnsSdSvcInfo {
        let mut svc = DnsSdSvcInfo::new("_uscan._tcp", port);
        let txt = &mut svc.txt;

        txt.add("duplex", if self.duplex { "T" } else { "F" });
        txt.add(
            "is",
            match (self.platen, self.adf) {
                (true, false) => "platen",
                (false, true) => "adf",
                _ => "platen,adf",
            },
        );
        let cs: Vec<&str> = self.cs.iter().map(String::as_str).collect();
        txt.if_not_empty("cs", &cs.join(","));
        txt.if_not_empty("UUID", &self.uuid);
        let pdl: Vec<&str> = self.pdl.iter().map(String::as_str).collect();
        txt.if_not_empty("pdl", &pdl.join(","));
        txt.add("ty", &usbinfo.mfg_and_product());
        txt.add("rs", "eSCL");
        txt.if_not_empty("vers", &self.version);
        txt.add("txtvers", "1");

        svc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::err::Result;
    use crate::http::message::Body;
    use crate::http::Response;
    use std::sync::Mutex;

    const FULL_CAPS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<scan:ScannerCapabilities xmlns:scan="http://schemas.hp.com/imaging/escl/2011/05/03"
                          xmlns:pwg="http://www.pwg.org/schemas/2010/12/sm">
  <pwg:Version>2.63</pwg:Version>
  <scan:UUID>9b4bde26-69de-4a9c-8d55-3a1637f9c9e2</scan:UUID>
  <scan:Platen>
    <scan:PlatenInputCaps>
      <scan:SettingProfiles>
        <scan:SettingProfile>
          <scan:ColorModes>
            <scan:ColorMode>RGB24</scan:ColorMode>
            <scan:ColorMode>Grayscale8</scan:ColorMode>
          </scan:ColorModes>
          <scan:DocumentFormats>
            <pwg:DocumentFormat>application/pdf</pwg:DocumentFormat>
            <pwg:DocumentFormat>image/jpeg</pwg:DocumentFormat>
          </scan:DocumentFormats>
        </scan:SettingProfile>
      </scan:SettingProfiles>
    </scan:PlatenInputCaps>
  </scan:Platen>
  <scan:Adf>
    <scan:AdfSimplexInputCaps>
      <scan:SettingProfiles>
        <scan:SettingProfile>
          <scan:ColorModes>
            <scan:ColorMode>BlackAndWhite1</scan:ColorMode>
          </scan:ColorModes>
          <scan:DocumentFormats>
            <pwg:DocumentFormat>image/jpeg</pwg:DocumentFormat>
          </scan:DocumentFormats>
        </scan:SettingProfile>
      </scan:SettingProfiles>
    </scan:AdfSimplexInputCaps>
    <scan:AdfDuplexCaps>
      <scan:SettingProfiles>
        <scan:SettingProfile>
          <scan:ColorModes>
            <scan:ColorMode>RGB24</scan:ColorMode>
          </scan:ColorModes>
          <scan:DocumentFormats>
            <pwg:DocumentFormat>application/pdf</pwg:DocumentFormat>
          </scan:DocumentFormats>
        </scan:SettingProfile>
      </scan:SettingProfiles>
    </scan:AdfDuplexCaps>
  </scan:Adf>
</scan:ScannerCapabilities>"#;

    fn usbinfo() -> UsbDeviceInfo {
        UsbDeviceInfo {
            vendor: 0x03f0,
            product: 0x0c17,
            serial: "CN12345".into(),
            manufacturer: "HP".into(),
            product_name: "HP LaserJet MFP M28w".into(),
        }
    }

    #[test]
    fn decodes_full_capabilities() {
        let caps = ScannerCaps::decode(FULL_CAPS.as_bytes()).unwrap();
        assert_eq!(caps.uuid, "9b4bde26-69de-4a9c-8d55-3a1637f9c9e2");
        assert_eq!(caps.version, "2.63");
        assert!(caps.platen);
        assert!(caps.adf);
        assert!(caps.duplex);
        assert_eq!(
            caps.cs.iter().cloned().collect::<Vec<_>>(),
            vec!["binary", "color", "grayscale"]
        );
        assert_eq!(
            caps.pdl.iter().cloned().collect::<Vec<_>>(),
            vec!["application/pdf", "image/jpeg"]
        );
    }

    #[test]
    fn txt_record_shape() {
        let caps = ScannerCaps::decode(FULL_CAPS.as_bytes()).unwrap();
        let svc = caps.into_service(60000, &usbinfo());

        assert_eq!(svc.svc_type, "_uscan._tcp");
        assert_eq!(svc.port, 60000);
        let txt = &svc.txt;
        assert_eq!(txt.get("duplex"), Some("T"));
        assert_eq!(txt.get("is"), Some("platen,adf"));
        assert_eq!(txt.get("cs"), Some("binary,color,grayscale"));
        assert_eq!(txt.get("UUID"), Some("9b4bde26-69de-4a9c-8d55-3a1637f9c9e2"));
        assert_eq!(txt.get("pdl"), Some("application/pdf,image/jpeg"));
        assert_eq!(txt.get("ty"), Some("HP LaserJet MFP M28w"));
        assert_eq!(txt.get("rs"), Some("eSCL"));
        assert_eq!(txt.get("vers"), Some("2.63"));
        assert_eq!(txt.get("txtvers"), Some("1"));
    }

    #[test]
    fn platen_only_scanner_is_valid() {
        let xml = FULL_CAPS.replace("scan:Adf>", "scan:Ignored>")
            .replace("<scan:AdfSimplexInputCaps>", "<scan:X>")
            .replace("</scan:AdfSimplexInputCaps>", "</scan:X>")
            .replace("<scan:AdfDuplexCaps>", "<scan:Y>")
            .replace("</scan:AdfDuplexCaps>", "</scan:Y>");
        let caps = ScannerCaps::decode(xml.as_bytes()).unwrap();
        assert!(caps.platen);
        assert!(!caps.adf);
        assert!(!caps.duplex);

        let svc = caps.into_service(60000, &usbinfo());
        assert_eq!(svc.txt.get("is"), Some("platen"));
        assert_eq!(svc.txt.get("duplex"), Some("F"));
    }

    #[test]
    fn missing_uuid_is_invalid() {
        let xml = FULL_CAPS.replace("scan:UUID", "scan:NoUUID");
        assert!(matches!(
            ScannerCaps::decode(xml.as_bytes()),
            Err(Error::Escl(_))
        ));
    }

    #[test]
    fn missing_formats_are_invalid() {
        let xml = FULL_CAPS.replace("pwg:DocumentFormat", "pwg:Nope");
        assert!(matches!(
            ScannerCaps::decode(xml.as_bytes()),
            Err(Error::Escl(_))
        ));
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(ScannerCaps::decode(b"not xml at all").is_err());
    }

    struct FakeRt {
        reply: Mutex<Option<Result<(u16, Vec<u8>)>>>,
    }

    impl RoundTripper for FakeRt {
        fn round_trip(
            &self,
            _request: Request,
        ) -> impl std::future::Future<Output = Result<Response>> + Send {
            let reply = self.reply.lock().unwrap().take();
            async move {
                match reply {
                    Some(Ok((status, body))) => {
                        let mut response = Response::new(status);
                        response.body = Body::Bytes(body);
                        Ok(response)
                    }
                    Some(Err(e)) => Err(e),
                    None => Err(Error::TransportUnavailable),
                }
            }
        }
    }

    #[tokio::test]
    async fn probe_builds_service_from_device_reply() {
        let rt = FakeRt {
            reply: Mutex::new(Some(Ok((200, FULL_CAPS.as_bytes().to_vec())))),
        };
        let svc = escl_service(&rt, 60000, &usbinfo()).await.unwrap();
        assert_eq!(svc.svc_type, "_uscan._tcp");
        assert_eq!(svc.txt.get("rs"), Some("eSCL"));
    }

    #[tokio::test]
    async fn probe_maps_http_errors_to_escl_error() {
        let rt = FakeRt {
            reply: Mutex::new(Some(Ok((404, Vec::new())))),
        };
        assert!(matches!(
            escl_service(&rt, 60000, &usbinfo()).await,
            Err(Error::Escl(_))
        ));
    }
}
