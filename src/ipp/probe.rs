//! IPP probe and DNS-SD record builder
//!
//! Issues Get-Printer-Attributes through the device's round-trip
//! capability and distills the reply into the `_ipp._tcp` TXT record,
//! the auxiliary fax keys, and the LPD stub that the Bonjour printing
//! specification demands.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::dnssd::DnsSdSvcInfo;
use crate::err::{Error, Result};
use crate::http::{Request, RoundTripper};
use crate::ipp::codec::{
    IppAttribute, IppMessage, IppValue, OP_GET_PRINTER_ATTRIBUTES, TAG_OPERATION_ATTRIBUTES,
    VALUE_TAG_CHARSET, VALUE_TAG_NATURAL_LANGUAGE, VALUE_TAG_URI,
};
use crate::usb::info::{uuid_normalize, UsbDeviceInfo};

/// Printer information that is needed beyond the TXT record itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IppPrinterInfo {
    pub dns_sd_name: String,
    pub uuid: String,
    pub admin_url: String,
    pub icon_url: String,
}

/// Probe the printer over IPP and build its service records: the LPD
/// stub and the `_ipp._tcp` service. eSCL is probed separately.
pub async fn ipp_service<T: RoundTripper>(
    rt: &T,
    port: u16,
    usbinfo: &UsbDeviceInfo,
) -> Result<(IppPrinterInfo, Vec<DnsSdSvcInfo>)> {
    let uri = format!("http://localhost:{port}/ipp/print");
    let msg = get_printer_attributes(rt, &uri).await?;

    let attrs = IppAttrs::from_message(&msg);
    let (info, mut ipp_svc) = attrs.decode(usbinfo, port);

    // Fax support shows as a working faxout endpoint.
    let fax_uri = format!("http://localhost:{port}/ipp/faxout");
    match get_printer_attributes(rt, &fax_uri).await {
        Ok(_) => {
            debug!("IPP FaxOut service detected");
            ipp_svc.txt.add("Fax", "T");
            ipp_svc.txt.add("rfo", "ipp/faxout");
        }
        Err(e) => {
            debug!(error = %e, "IPP FaxOut service not present");
            ipp_svc.txt.add("Fax", "F");
        }
    }

    // Per the Bonjour printing spec, LPD must be advertised with port 0
    // even though we do not serve it.
    let lpd = DnsSdSvcInfo::new("_printer._tcp", 0);

    Ok((info, vec![lpd, ipp_svc]))
}

/// One Get-Printer-Attributes transaction. Success means the HTTP
/// exchange worked, the reply decoded, and the IPP status is not an
/// error.
pub async fn get_printer_attributes<T: RoundTripper>(rt: &T, uri: &str) -> Result<IppMessage> {
    let msg = build_get_printer_attributes(uri);
    trace!(uri, "IPP request: Get-Printer-Attributes");

    let (host, path) = split_uri(uri)?;
    let request = Request::new("POST", path)
        .with_header("Host", host)
        .with_header("Content-Type", "application/ipp")
        .with_body(msg.encode());

    let response = rt.round_trip(request).await?;
    if !response.is_success() {
        return Err(Error::Ipp(format!("HTTP: {} {}", response.status, response.reason)));
    }

    let body = response.body.collect().await?;
    let reply = IppMessage::decode(&body)?;
    trace!(
        status = reply.code,
        groups = reply.groups.len(),
        "IPP response"
    );

    if reply.code >= 100 {
        return Err(Error::Ipp(format!("IPP status 0x{:04x}", reply.code)));
    }
    Ok(reply)
}

/// The standard four operation attributes, in order.
fn build_get_printer_attributes(uri: &str) -> IppMessage {
    let mut msg = IppMessage::request(OP_GET_PRINTER_ATTRIBUTES, 1);
    let op = msg.group_mut(TAG_OPERATION_ATTRIBUTES);
    op.attributes.push(IppAttribute::new(
        "attributes-charset",
        IppValue::Str(VALUE_TAG_CHARSET, "utf-8".into()),
    ));
    op.attributes.push(IppAttribute::new(
        "attributes-natural-language",
        IppValue::Str(VALUE_TAG_NATURAL_LANGUAGE, "en-US".into()),
    ));
    op.attributes.push(IppAttribute::new(
        "printer-uri",
        IppValue::Str(VALUE_TAG_URI, uri.into()),
    ));
    op.attributes.push(IppAttribute::new(
        "requested-attributes",
        IppValue::keyword("all"),
    ));
    msg
}

/// `http://host:port/path` → (host:port, /path)
fn split_uri(uri: &str) -> Result<(&str, &str)> {
    let rest = uri
        .strip_prefix("http://")
        .ok_or_else(|| Error::Ipp(format!("bad probe uri `{uri}`")))?;
    match rest.find('/') {
        Some(pos) => Ok((&rest[..pos], &rest[pos..])),
        None => Ok((rest, "/")),
    }
}

/// Printer attributes enrolled into a map. When an attribute appears more
/// than once in the reply, the first occurrence wins.
struct IppAttrs(HashMap<String, Vec<IppValue>>);

impl IppAttrs {
    fn from_message(msg: &IppMessage) -> Self {
        let mut map = HashMap::new();
        // Walking back-to-front makes the first occurrence the survivor.
        for attr in msg.printer_attributes().collect::<Vec<_>>().into_iter().rev() {
            map.insert(attr.name.clone(), attr.values.clone());
        }
        Self(map)
    }

    /// Build the `_ipp._tcp` service and the auxiliary printer info.
    ///
    /// TXT keys and their sources:
    ///   air:              hardcoded "none"
    ///   mopria-certified: "mopria-certified"
    ///   rp:               hardcoded "ipp/print"
    ///   priority:         hardcoded "50"
    ///   kind:             "printer-kind"
    ///   PaperMax:         classification of "media-size-supported"
    ///   URF:              "urf-supported", else URF from "printer-device-id"
    ///   UUID:             "printer-uuid" (normalized), else synthesized
    ///   Color:            "color-supported"
    ///   Duplex:           from "sides-supported" one*/two* prefixes
    ///   note:             "printer-location"
    ///   qtotal:           hardcoded "1"
    ///   usb_MDL/MFG/CMD:  parsed out of "printer-device-id"
    ///   ty:               "printer-make-and-model"
    ///   product:          "printer-make-and-model" in round brackets
    ///   pdl:              "document-format-supported"
    ///   txtvers:          hardcoded "1"
    ///   adminurl:         "printer-more-info", only when it is a URL
    fn decode(&self, usbinfo: &UsbDeviceInfo, port: u16) -> (IppPrinterInfo, DnsSdSvcInfo) {
        let mut svc = DnsSdSvcInfo::new("_ipp._tcp", port);
        svc.sub_types.push("_universal._sub._ipp._tcp".to_string());

        let mut info = IppPrinterInfo {
            admin_url: self.str_single("printer-more-info"),
            icon_url: self.str_single("printer-icons"),
            ..IppPrinterInfo::default()
        };

        // DNS-SD name falls back through a chain down to the USB strings.
        info.dns_sd_name = self.str_single("printer-dns-sd-name");
        if info.dns_sd_name.is_empty() {
            info.dns_sd_name = self.str_single("printer-info");
        }
        if info.dns_sd_name.is_empty() {
            info.dns_sd_name = self.str_single("printer-make-and-model");
        }
        if info.dns_sd_name.is_empty() {
            info.dns_sd_name = usbinfo.mfg_and_product();
        }

        let raw_uuid = self.str_single("printer-uuid");
        info.uuid = uuid_normalize(&raw_uuid).unwrap_or_else(|| usbinfo.uuid());

        // IEEE 1284 device id: semicolon-separated KEY:VALUE pairs.
        let mut devid: HashMap<&str, &str> = HashMap::new();
        let devid_raw = self.str_single("printer-device-id");
        for item in devid_raw.split(';') {
            if let Some((key, value)) = item.split_once(':') {
                devid.insert(key.trim(), value.trim());
            }
        }

        let txt = &mut svc.txt;
        txt.add("air", "none");
        txt.if_not_empty("mopria-certified", &self.str_single("mopria-certified"));
        txt.add("rp", "ipp/print");
        txt.add("priority", "50");
        txt.if_not_empty("kind", &self.str_joined("printer-kind"));
        txt.if_not_empty("PaperMax", &self.paper_max());
        if !txt.if_not_empty("URF", &self.str_joined("urf-supported")) {
            txt.if_not_empty("URF", devid.get("URF").unwrap_or(&""));
        }
        txt.if_not_empty("UUID", &info.uuid);
        txt.if_not_empty("Color", &self.get_bool("color-supported"));
        txt.if_not_empty("Duplex", &self.duplex());
        txt.add("note", &self.str_single("printer-location"));
        txt.add("qtotal", "1");
        txt.if_not_empty("usb_MDL", devid.get("MDL").unwrap_or(&""));
        txt.if_not_empty("usb_MFG", devid.get("MFG").unwrap_or(&""));
        txt.if_not_empty("usb_CMD", devid.get("CMD").unwrap_or(&""));
        txt.if_not_empty("ty", &self.str_single("printer-make-and-model"));
        txt.if_not_empty("product", &self.str_brackets("printer-make-and-model"));
        txt.if_not_empty("pdl", &self.str_joined("document-format-supported"));
        txt.add("txtvers", "1");
        txt.url_if_not_empty("adminurl", &info.admin_url);

        (info, svc)
    }

    /// "T" if any sides-supported value starts with "two", "F" if any
    /// starts with "one", "" when the printer cannot tell.
    fn duplex(&self) -> String {
        let mut one = false;
        let mut two = false;
        for s in self.get_strings("sides-supported") {
            if s.starts_with("one") {
                one = true;
            } else if s.starts_with("two") {
                two = true;
            }
        }
        if two {
            "T".into()
        } else if one {
            "F".into()
        } else {
            String::new()
        }
    }

    /// Max x/y across "media-size-supported" members, classified into the
    /// Bonjour PaperMax buckets. Dimensions are hundredths of millimeters;
    /// ranges count with their upper bound.
    fn paper_max(&self) -> String {
        let values = match self.0.get("media-size-supported") {
            Some(values) if matches!(values.first(), Some(IppValue::Collection(_))) => values,
            _ => return String::new(),
        };

        let mut x_max = 0;
        let mut y_max = 0;
        for value in values {
            let IppValue::Collection(members) = value else {
                continue;
            };
            // First occurrence of each member wins, as everywhere else.
            let mut x = None;
            let mut y = None;
            for member in members {
                match member.name.as_str() {
                    "x-dimension" if x.is_none() => x = member.values.first(),
                    "y-dimension" if y.is_none() => y = member.values.first(),
                    _ => {}
                }
            }
            if let Some(dim) = x.and_then(IppValue::upper_int) {
                x_max = x_max.max(dim);
            }
            if let Some(dim) = y.and_then(IppValue::upper_int) {
                y_max = y_max.max(dim);
            }
        }

        if x_max == 0 || y_max == 0 {
            return String::new();
        }
        classify_paper(x_max, y_max).to_string()
    }

    fn str_single(&self, name: &str) -> String {
        self.get_strings(name).first().cloned().unwrap_or_default()
    }

    fn str_joined(&self, name: &str) -> String {
        self.get_strings(name).join(",")
    }

    fn str_brackets(&self, name: &str) -> String {
        let s = self.str_single(name);
        if s.is_empty() {
            s
        } else {
            format!("({s})")
        }
    }

    /// String values of an attribute. A type mismatch on the first value
    /// makes the whole attribute count as absent.
    fn get_strings(&self, name: &str) -> Vec<String> {
        match self.0.get(name) {
            Some(values) if matches!(values.first(), Some(IppValue::Str(_, _))) => values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// "T"/"F" for a boolean attribute, "" when absent or mistyped.
    fn get_bool(&self, name: &str) -> String {
        match self.0.get(name).and_then(|v| v.first()) {
            Some(IppValue::Boolean(true)) => "T".into(),
            Some(IppValue::Boolean(false)) => "F".into(),
            _ => String::new(),
        }
    }
}

/// Bonjour Printing Specification 1.2.1 PaperMax buckets, in hundredths
/// of a millimeter. A size exactly on a boundary falls into the smaller
/// bucket.
fn classify_paper(x: i32, y: i32) -> &'static str {
    const A4: (i32, i32) = (21000, 29700);
    const LEGAL: (i32, i32) = (21590, 35560);
    const A3: (i32, i32) = (29700, 42000);
    const TABLOID: (i32, i32) = (27940, 43180);
    const A2: (i32, i32) = (42000, 59400);
    const ISO_C: (i32, i32) = (43180, 55880);

    let fits = |limit: (i32, i32)| x <= limit.0 && y <= limit.1;
    let under = |limit: (i32, i32)| x < limit.0 && y < limit.1;

    if under(A4) && under(LEGAL) {
        "<legal-A4"
    } else if fits(A4) || fits(LEGAL) {
        "legal-A4"
    } else if fits(A3) || fits(TABLOID) {
        "tabloid-A3"
    } else if fits(A2) || fits(ISO_C) {
        "isoC-A2"
    } else {
        ">isoC-A2"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::err::Result;
    use crate::http::message::Body;
    use crate::http::Response;
    use crate::ipp::codec::*;
    use std::sync::Mutex;

    fn usbinfo() -> UsbDeviceInfo {
        UsbDeviceInfo {
            vendor: 0x03f0,
            product: 0x0c17,
            serial: "CN12345".into(),
            manufacturer: "HP".into(),
            product_name: "HP LaserJet MFP M28w".into(),
        }
    }

    fn str_attr(name: &str, tag: u8, values: &[&str]) -> IppAttribute {
        IppAttribute {
            name: name.into(),
            values: values
                .iter()
                .map(|v| IppValue::Str(tag, v.to_string()))
                .collect(),
        }
    }

    fn rich_reply() -> IppMessage {
        let mut msg = IppMessage {
            version: IPP_VERSION,
            code: 0,
            request_id: 1,
            groups: Vec::new(),
        };
        let group = msg.group_mut(TAG_PRINTER_ATTRIBUTES);
        group.attributes.extend([
            str_attr("printer-dns-sd-name", VALUE_TAG_NAME, &["HP LaserJet"]),
            str_attr(
                "printer-make-and-model",
                VALUE_TAG_TEXT,
                &["HP LaserJet MFP M28w"],
            ),
            str_attr("printer-location", VALUE_TAG_TEXT, &["attic"]),
            str_attr(
                "printer-uuid",
                VALUE_TAG_URI,
                &["urn:uuid:9B4BDE26-69DE-4A9C-8D55-3A1637F9C9E2"],
            ),
            str_attr(
                "printer-device-id",
                VALUE_TAG_TEXT,
                &["MFG:HP;MDL:LaserJet MFP M28w;CMD:PCLmS,PWGRaster;"],
            ),
            str_attr(
                "document-format-supported",
                VALUE_TAG_MIME_MEDIA_TYPE,
                &["application/pdf", "image/pwg-raster"],
            ),
            str_attr(
                "sides-supported",
                VALUE_TAG_KEYWORD,
                &["one-sided", "two-sided-long-edge"],
            ),
            str_attr("printer-kind", VALUE_TAG_KEYWORD, &["document", "photo"]),
            str_attr(
                "printer-more-info",
                VALUE_TAG_URI,
                &["http://127.0.0.1:60000/admin"],
            ),
            IppAttribute::new("color-supported", IppValue::Boolean(true)),
            IppAttribute {
                name: "media-size-supported".into(),
                values: vec![
                    IppValue::Collection(vec![
                        IppAttribute::new("x-dimension", IppValue::Integer(21000)),
                        IppAttribute::new("y-dimension", IppValue::Integer(29700)),
                    ]),
                    IppValue::Collection(vec![
                        IppAttribute::new("x-dimension", IppValue::Integer(21590)),
                        IppAttribute::new("y-dimension", IppValue::Range(8400, 35560)),
                    ]),
                ],
            },
        ]);
        msg
    }

    /// Round-tripper that answers /ipp/print and /ipp/faxout from a
    /// queue of (status, ipp-reply) pairs.
    struct FakeRt {
        replies: Mutex<std::collections::VecDeque<Result<(u16, Vec<u8>)>>>,
    }

    impl FakeRt {
        fn new(replies: Vec<Result<(u16, Vec<u8>)>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
            }
        }
    }

    impl RoundTripper for FakeRt {
        fn round_trip(
            &self,
            _request: Request,
        ) -> impl std::future::Future<Output = Result<Response>> + Send {
            let reply = self.replies.lock().unwrap().pop_front();
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

    fn ok_reply(msg: &IppMessage) -> Result<(u16, Vec<u8>)> {
        Ok((200, msg.encode()))
    }

    #[tokio::test]
    async fn builds_full_txt_record() {
        let rt = FakeRt::new(vec![
            ok_reply(&rich_reply()),
            Err(Error::Ipp("HTTP: 404 Not Found".into())), // no faxout
        ]);

        let (info, services) = ipp_service(&rt, 60000, &usbinfo()).await.unwrap();

        assert_eq!(info.dns_sd_name, "HP LaserJet");
        assert_eq!(info.uuid, "9b4bde26-69de-4a9c-8d55-3a1637f9c9e2");
        assert_eq!(info.admin_url, "http://127.0.0.1:60000/admin");

        // LPD stub first: port 0, empty TXT.
        assert_eq!(services[0].svc_type, "_printer._tcp");
        assert_eq!(services[0].port, 0);
        assert!(services[0].txt.is_empty());

        let ipp = &services[1];
        assert_eq!(ipp.svc_type, "_ipp._tcp");
        assert_eq!(ipp.sub_types, vec!["_universal._sub._ipp._tcp"]);
        assert_eq!(ipp.port, 60000);

        let txt = &ipp.txt;
        assert_eq!(txt.get("air"), Some("none"));
        assert_eq!(txt.get("rp"), Some("ipp/print"));
        assert_eq!(txt.get("priority"), Some("50"));
        assert_eq!(txt.get("kind"), Some("document,photo"));
        assert_eq!(txt.get("UUID"), Some("9b4bde26-69de-4a9c-8d55-3a1637f9c9e2"));
        assert_eq!(txt.get("Color"), Some("T"));
        assert_eq!(txt.get("Duplex"), Some("T"));
        assert_eq!(txt.get("note"), Some("attic"));
        assert_eq!(txt.get("qtotal"), Some("1"));
        assert_eq!(txt.get("usb_MFG"), Some("HP"));
        assert_eq!(txt.get("usb_MDL"), Some("LaserJet MFP M28w"));
        assert_eq!(txt.get("usb_CMD"), Some("PCLmS,PWGRaster"));
        assert_eq!(txt.get("ty"), Some("HP LaserJet MFP M28w"));
        assert_eq!(txt.get("product"), Some("(HP LaserJet MFP M28w)"));
        assert_eq!(txt.get("pdl"), Some("application/pdf,image/pwg-raster"));
        assert_eq!(txt.get("txtvers"), Some("1"));
        assert_eq!(txt.get("adminurl"), Some("http://127.0.0.1:60000/admin"));
        // Max size is legal (21590 x 35560).
        assert_eq!(txt.get("PaperMax"), Some("legal-A4"));
        assert_eq!(txt.get("Fax"), Some("F"));
        assert!(txt.get("rfo").is_none());
    }

    #[tokio::test]
    async fn fax_probe_success_adds_fax_keys() {
        let rt = FakeRt::new(vec![ok_reply(&rich_reply()), ok_reply(&rich_reply())]);

        let (_, services) = ipp_service(&rt, 60000, &usbinfo()).await.unwrap();
        let txt = &services[1].txt;
        assert_eq!(txt.get("Fax"), Some("T"));
        assert_eq!(txt.get("rfo"), Some("ipp/faxout"));
    }

    #[tokio::test]
    async fn name_chain_falls_back_to_usb_strings() {
        let mut msg = rich_reply();
        for group in &mut msg.groups {
            group.attributes.retain(|a| {
                !matches!(
                    a.name.as_str(),
                    "printer-dns-sd-name" | "printer-info" | "printer-make-and-model"
                )
            });
        }
        let rt = FakeRt::new(vec![ok_reply(&msg), Err(Error::Ipp("no fax".into()))]);

        let (info, _) = ipp_service(&rt, 60000, &usbinfo()).await.unwrap();
        assert_eq!(info.dns_sd_name, "HP LaserJet MFP M28w");
    }

    #[tokio::test]
    async fn duplicate_attribute_first_occurrence_wins() {
        let mut msg = rich_reply();
        msg.group_mut(TAG_PRINTER_ATTRIBUTES)
            .attributes
            .push(str_attr("printer-location", VALUE_TAG_TEXT, &["basement"]));

        let rt = FakeRt::new(vec![ok_reply(&msg), Err(Error::Ipp("no fax".into()))]);
        let (_, services) = ipp_service(&rt, 60000, &usbinfo()).await.unwrap();
        assert_eq!(services[1].txt.get("note"), Some("attic"));
    }

    #[tokio::test]
    async fn mistyped_attribute_counts_as_absent() {
        let mut msg = rich_reply();
        for group in &mut msg.groups {
            group.attributes.retain(|a| a.name != "color-supported");
        }
        msg.group_mut(TAG_PRINTER_ATTRIBUTES)
            .attributes
            .push(str_attr("color-supported", VALUE_TAG_KEYWORD, &["true"]));

        let rt = FakeRt::new(vec![ok_reply(&msg), Err(Error::Ipp("no fax".into()))]);
        let (_, services) = ipp_service(&rt, 60000, &usbinfo()).await.unwrap();
        assert!(services[1].txt.get("Color").is_none());
    }

    #[tokio::test]
    async fn ipp_error_status_fails_the_probe() {
        let mut msg = rich_reply();
        msg.code = 0x0400; // client-error-bad-request

        let rt = FakeRt::new(vec![ok_reply(&msg)]);
        let err = ipp_service(&rt, 60000, &usbinfo()).await.unwrap_err();
        assert!(matches!(err, Error::Ipp(_)));
    }

    #[tokio::test]
    async fn http_error_fails_the_probe() {
        let rt = FakeRt::new(vec![Ok((503, Vec::new()))]);
        let err = ipp_service(&rt, 60000, &usbinfo()).await.unwrap_err();
        assert!(matches!(err, Error::Ipp(_)));
    }

    #[tokio::test]
    async fn undecodable_reply_fails_the_probe() {
        let rt = FakeRt::new(vec![Ok((200, b"this is not ipp".to_vec()))]);
        let err = ipp_service(&rt, 60000, &usbinfo()).await.unwrap_err();
        assert!(matches!(err, Error::Ipp(_)));
    }

    #[test]
    fn paper_classification_buckets() {
        assert_eq!(classify_paper(10500, 14800), "<legal-A4"); // A6
        assert_eq!(classify_paper(21000, 29700), "legal-A4"); // exactly A4
        assert_eq!(classify_paper(21590, 35560), "legal-A4"); // exactly legal
        assert_eq!(classify_paper(29700, 42000), "tabloid-A3"); // exactly A3
        assert_eq!(classify_paper(27940, 43180), "tabloid-A3"); // tabloid
        assert_eq!(classify_paper(42000, 59400), "isoC-A2"); // exactly A2
        assert_eq!(classify_paper(43180, 55880), "isoC-A2"); // exactly C
        assert_eq!(classify_paper(60000, 90000), ">isoC-A2"); // A1-ish
    }

    #[test]
    fn probe_request_encodes_the_standard_attributes() {
        let msg = build_get_printer_attributes("http://localhost:60000/ipp/print");
        let decoded = IppMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);

        let op = &decoded.groups[0];
        assert_eq!(op.delimiter, TAG_OPERATION_ATTRIBUTES);
        let names: Vec<_> = op.attributes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "attributes-charset",
                "attributes-natural-language",
                "printer-uri",
                "requested-attributes"
            ]
        );
    }
}
